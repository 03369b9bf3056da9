//! # Historian Module
//!
//! Adapters that implement `core::HistorianReader` for concrete historians.
//!
//! ## Contained Modules:
//! - **`canary`**: Canary Views Web API v2 reader with session handling, tag
//!   discovery and paged data retrieval.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Canary Views Web API reader.
pub mod canary;

pub use canary::{views_base_url, CanaryAuth, CanaryOptions, CanaryReader};
