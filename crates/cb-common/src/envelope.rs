//! Event envelope normalization
//!
//! Broker messages arrive as JSON with loosely standardized metadata. The
//! envelope pins down the event type and source event id so the rest of the
//! pipeline never re-derives them.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

/// Event type used when nothing in the payload or headers identifies one.
pub const UNKNOWN_EVENT_TYPE: &str = "unknown.event";

/// Normalized form of one incoming broker message.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event_type: String,
    pub source_event_id: Uuid,
    pub payload: Value,
}

impl EventEnvelope {
    /// Builds an envelope from a parsed payload and the broker headers.
    ///
    /// Event type: first non-empty of `payload.eventType`, `payload.type`,
    /// `payload.@type`, then the `eventType`/`event-type`/`type` headers,
    /// else [`UNKNOWN_EVENT_TYPE`]. Event id: first UUID-parseable of
    /// `payload.eventId`, `payload.id`, then the `eventId`/`event-id`
    /// headers, else a fresh UUID.
    pub fn from_parts(payload: Value, headers: &HashMap<String, String>) -> Self {
        let event_type = extract_event_type(&payload, headers);
        let source_event_id = extract_event_id(&payload, headers);
        Self {
            event_type,
            source_event_id,
            payload,
        }
    }
}

fn extract_event_type(payload: &Value, headers: &HashMap<String, String>) -> String {
    for key in ["eventType", "type", "@type"] {
        if let Some(value) = payload.get(key).and_then(Value::as_str) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    for key in ["eventType", "event-type", "type"] {
        if let Some(value) = headers.get(key) {
            if !value.is_empty() {
                return value.clone();
            }
        }
    }
    UNKNOWN_EVENT_TYPE.to_string()
}

fn extract_event_id(payload: &Value, headers: &HashMap<String, String>) -> Uuid {
    for key in ["eventId", "id"] {
        if let Some(id) = payload
            .get(key)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            return id;
        }
    }
    for key in ["eventId", "event-id"] {
        if let Some(id) = headers.get(key).and_then(|s| Uuid::parse_str(s).ok()) {
            return id;
        }
    }
    Uuid::new_v4()
}
