mod tests_format;
