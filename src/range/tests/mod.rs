mod tests_recover;
mod tests_set;
