mod tests_dump;
