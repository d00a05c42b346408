mod tests_update;
mod tests_upsert;
