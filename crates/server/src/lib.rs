//! courier-server: configuration and process wiring for the job runner.

pub mod app;
pub mod config;

pub use app::{build_registry, run, shutdown_signal};
pub use config::Config;
