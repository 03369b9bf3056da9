//! # Historian Samples
//!
//! The immutable unit of data that flows through the forwarder: one
//! time-stamped value of one historian tag, together with its quality.
//!
//! Samples are produced by a `HistorianReader`, encoded into the MQTT payload
//! shape by [`Sample::to_payload`] and then handed to a `BrokerPublisher`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// # Quality
///
/// Data quality attached to every sample. Serialized in upper case
/// (`"GOOD"`, `"BAD"`, `"UNCERTAIN"`) in the published payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quality {
    /// The value is trustworthy.
    Good,
    /// The value is known to be wrong (sensor failure, comm loss, ...).
    Bad,
    /// The value may be usable but is not confirmed.
    Uncertain,
}

impl Quality {
    /// Maps an OPC-style numeric quality code (as reported by Canary) onto
    /// the three-state quality. Only the two most significant status bits of
    /// the low byte matter: `0xC0` is good, `0x40` uncertain, `0x00` bad.
    pub fn from_opc_code(code: i64) -> Self {
        match code & 0xC0 {
            0xC0 => Quality::Good,
            0x40 => Quality::Uncertain,
            _ => Quality::Bad,
        }
    }
}

/// # Sample Value
///
/// A scalar value as stored by the historian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleValue {
    /// Any numeric value. Booleans are carried as `1.0` / `0.0`.
    Number(f64),
    /// Free-form string values (states, batch ids, ...).
    Text(String),
}

/// Raised when a sample cannot be turned into a publishable payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// JSON cannot represent NaN or infinities.
    #[error("non-finite value {value} for tag {tag}")]
    NonFinite { tag: String, value: f64 },
    /// Serializer failure.
    #[error("payload serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// # Sample
///
/// One `(timestamp, value, quality)` tuple of one tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Full historian path of the tag, e.g. `Plant.Area.Tank1.Level`.
    pub tag: String,
    /// Point in time the value was recorded at.
    pub timestamp: DateTime<Utc>,
    /// The recorded value.
    pub value: SampleValue,
    /// Quality reported by the historian.
    pub quality: Quality,
}

#[derive(Serialize)]
struct Payload<'a> {
    tag: &'a str,
    timestamp: String,
    value: &'a SampleValue,
    quality: Quality,
}

impl Sample {
    pub fn new(tag: impl Into<String>, timestamp: DateTime<Utc>, value: SampleValue, quality: Quality) -> Self {
        Self {
            tag: tag.into(),
            timestamp,
            value,
            quality,
        }
    }

    /// Encodes the sample into the JSON message published on MQTT:
    /// `{"tag", "timestamp" (RFC 3339), "value", "quality"}`.
    pub fn to_payload(&self) -> Result<Vec<u8>, PayloadError> {
        if let SampleValue::Number(v) = self.value {
            if !v.is_finite() {
                return Err(PayloadError::NonFinite {
                    tag: self.tag.clone(),
                    value: v,
                });
            }
        }

        let payload = Payload {
            tag: &self.tag,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            value: &self.value,
            quality: self.quality,
        };
        Ok(serde_json::to_vec(&payload)?)
    }
}
