pub mod event;
pub mod monitor;
pub mod shared_vars;
