//! # Core Forwarding Module
//!
//! This module holds everything the forwarder needs to move data from the
//! historian to the broker without knowing anything about Canary or MQTT.
//!
//! ## Core Components:
//!
//! - **`sample`**: the `(tag, timestamp, value, quality)` unit and its JSON
//!   payload encoding.
//!
//! - **`endpoints`**: the `HistorianReader` and `BrokerPublisher` capability
//!   traits implemented by the adapters.
//!
//! - **`watermark`**: the monotonic progress marker and its pluggable
//!   durable backing (`FileWatermarkStore`, `MemoryWatermarkStore`).
//!
//! - **`backoff`**: exponential retry delay with a cap.
//!
//! - **`forward_loop`**: the read → publish → advance state machine.
//!
//! - **`errors`**: transient/permanent error taxonomy.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Exponential backoff policy.
pub mod backoff;
/// Reader and publisher capability traits.
pub mod endpoints;
/// Error taxonomy shared by the loop and the adapters.
pub mod errors;
/// The poll-forward state machine.
pub mod forward_loop;
/// Historian samples and payload encoding.
pub mod sample;
/// Forwarding progress marker and its stores.
pub mod watermark;

// --- Public API Re-exports ---
pub use backoff::Backoff;
pub use endpoints::{BrokerPublisher, HistorianReader};
pub use errors::{ForwarderError, PublishError, PublishResult, ReadError, StoreError, WatermarkError};
pub use forward_loop::{ForwardLoop, ForwardSettings, LoopState, PermanentErrorPolicy, TickOutcome, TickReport};
pub use sample::{PayloadError, Quality, Sample, SampleValue};
pub use watermark::{FileWatermarkStore, MemoryWatermarkStore, Watermark, WatermarkSeed, WatermarkStore};
