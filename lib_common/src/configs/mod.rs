//! # Configuration Modules
//!
//! This module turns defaults, an optional JSON file, `.env`, environment
//! variables and command line flags into one validated `ForwarderConfig`.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Layered loader and validation of the forwarder settings.
pub mod forwarder_config;

pub use forwarder_config::{
    load_config, parse_mqtt_url, resolve, ConfigArgs, ConfigError, ForwarderConfig, DEFAULT_CONFIG_FILE,
};
