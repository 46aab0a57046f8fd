//! Utility functions and helpers.

pub mod logging;

pub use logging::{init_tracing, LogLevel, LoggingConfig};
