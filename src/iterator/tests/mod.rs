pub mod helpers;
mod tests_mem_iter;
mod tests_read;
