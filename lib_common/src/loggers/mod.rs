//! # Loggers Module
//!
//! Process-wide logging for the forwarder: the `log` facade dispatched by
//! `fern` to stdout and to a `tracing_appender` rolling file.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// fern setup over a rolling file appender.
pub mod logger;

pub use logger::{file_appender, parse_level, setup_logging, LogOptions, LogRotation};
