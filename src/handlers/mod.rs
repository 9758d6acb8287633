pub mod check_handlers;
pub mod file_handlers;
