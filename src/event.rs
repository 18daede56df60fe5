//! Event and batch data model.
//!
//! Callers build an [`Event`] with a type and a JSON payload. Identity and provenance
//! (`event_id`, `timestamp`, `source`, `version`) are stamped by the client at send time unless
//! the caller already set them, so a re-buffered event keeps its original id across retries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch, saturating on clock errors.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Fresh random (v4) identifier.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// A single telemetry/state event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_id: None,
            event_type: event_type.into(),
            timestamp: None,
            source: None,
            version: None,
            payload: Map::new(),
        }
    }

    /// Replace the whole payload.
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Set one payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.event_id = Some(id);
        self
    }

    /// True once every wire field has a value.
    pub fn is_stamped(&self) -> bool {
        self.event_id.is_some()
            && self.timestamp.is_some()
            && self.source.is_some()
            && self.version.is_some()
    }

    /// Fill any missing id/timestamp/source/version; fields the caller set are left alone.
    pub fn stamp(&mut self, source: &str, version: u32) {
        self.stamp_at(source, version, now_millis());
    }

    pub(crate) fn stamp_at(&mut self, source: &str, version: u32, now_ms: u64) {
        self.event_id.get_or_insert_with(new_id);
        self.timestamp.get_or_insert(now_ms);
        self.source.get_or_insert_with(|| source.to_string());
        self.version.get_or_insert(version);
    }
}

/// Several events shipped under one id to the batch endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub events: Vec<Event>,
    pub source: String,
    pub timestamp: u64,
}

impl Batch {
    /// Wrap already-stamped events under a fresh batch id.
    pub fn new(events: Vec<Event>, source: impl Into<String>) -> Self {
        Self { batch_id: new_id(), events, source: source.into(), timestamp: now_millis() }
    }
}
