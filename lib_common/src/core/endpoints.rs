//! # Endpoint Capabilities
//!
//! The two collaborators the forward loop talks to. The loop only relies on
//! the contracts below; the Canary and MQTT adapters live in the `historian`
//! and `broker` modules.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::core::errors::{PublishResult, ReadError};
use crate::core::sample::Sample;

/// Source of historian samples for one dataset.
pub trait HistorianReader {
    /// Returns the samples of `dataset_id` recorded strictly after `since`,
    /// ascending by timestamp. An empty vector means "nothing new".
    fn read_since(
        &mut self,
        dataset_id: &str,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Sample>, ReadError>> + Send;
}

/// Sink for encoded samples.
pub trait BrokerPublisher {
    /// Publishes one message. Resolves to `Ok` only after the broker
    /// acknowledged it at the configured QoS (never fire-and-forget).
    fn publish(&mut self, topic: &str, payload: &[u8]) -> impl Future<Output = PublishResult> + Send;
}
