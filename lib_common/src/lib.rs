//! # lib_common
//!
//! Building blocks of the Canary to MQTT forwarder. Every top-level module is
//! gated behind the Cargo feature of the same name so a binary only compiles
//! the parts it uses; `full` enables all of them.

// Declare the modules to re-export
#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "retrieve")]
pub mod retrieve;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "historian")]
pub mod historian;
#[cfg(feature = "broker")]
pub mod broker;
