mod tests_validate;
