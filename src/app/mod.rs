//! Application module
//!
//! Binary-facing pieces: CLI-level configuration, logging setup, fatal error
//! reporting, and wiring the production engine from config.

pub mod config;
pub mod error_handling;
pub mod logging;
pub mod runtime;

pub use config::AppConfig;
pub use error_handling::handle_fatal_error;
pub use logging::init_logging;
pub use runtime::{build_engine, build_engine_with, build_supervisor, lock_manager};
