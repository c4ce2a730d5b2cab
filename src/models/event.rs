//! Device events as they arrive from the message bus.

use serde::{Deserialize, Serialize};

/// A single sensor value captured by a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reading {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub pushed: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub created: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub origin: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub modified: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device: String,
    /// Value descriptor name, e.g. `temperature`.
    pub name: String,
    pub value: String,
}

impl Reading {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }
}

/// An event published by a device, carrying one or more readings.
///
/// Events are shared between workers behind an `Arc` and never mutated by
/// the pipeline. Filters that narrow the reading set produce a new value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Push timestamp in milliseconds, 0 when not yet pushed.
    #[serde(skip_serializing_if = "is_zero")]
    pub pushed: i64,
    pub device: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub created: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub modified: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub origin: i64,
    pub readings: Vec<Reading>,

    /// Payload exactly as received from the bus, used by passthrough formats.
    #[serde(skip)]
    pub raw: Option<Vec<u8>>,
}

impl Event {
    pub fn new(device: impl Into<String>, readings: Vec<Reading>) -> Self {
        Self {
            device: device.into(),
            readings,
            ..Default::default()
        }
    }

    /// Set the event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Decode a JSON payload, keeping the original bytes alongside.
    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        let mut event: Event = serde_json::from_slice(payload)?;
        event.raw = Some(payload.to_vec());
        Ok(event)
    }
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}
