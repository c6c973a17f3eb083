//! Notification model and decoder
//!
//! SOMIOD publishes a JSON document per fired subscription. Field extraction
//! is lenient (a missing key becomes an empty string) while syntax is strict:
//! only a payload that is not a JSON object at all is rejected.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Event reported by a subscription
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventType {
    Create,
    Update,
    Delete,
    /// Field absent or empty
    #[default]
    Unspecified,
    Other(String),
}

impl EventType {
    /// Accepts names and SOMIOD `evt` codes (1 = creation, 2 = deletion)
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" => EventType::Unspecified,
            "create" | "creation" | "created" | "1" => EventType::Create,
            "delete" | "deletion" | "deleted" | "2" => EventType::Delete,
            "update" | "updated" => EventType::Update,
            _ => EventType::Other(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
            EventType::Unspecified => "",
            EventType::Other(raw) => raw,
        }
    }

    pub fn is_creation(&self) -> bool {
        matches!(self, EventType::Create)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded notification; field order is the canonical document order
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Notification {
    pub subscription_name: String,
    /// Text as sent by the middleware; see `event()` for the parsed form
    pub event_type: String,
    pub resource_name: String,
    pub container_path: String,
    pub timestamp: String,
}

impl Notification {
    /// Parse a raw broker payload
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(payload)?;
        let object = match &value {
            Value::Object(object) => object,
            other => return Err(DecodeError::NotAnObject(json_kind(other))),
        };

        Ok(Notification {
            subscription_name: text_field(object, "subscription_name"),
            event_type: text_field(object, "event_type"),
            resource_name: text_field(object, "resource_name"),
            container_path: text_field(object, "container_path"),
            timestamp: text_field(object, "timestamp"),
        })
    }

    pub fn event(&self) -> EventType {
        EventType::parse(&self.event_type)
    }

    /// Wire form, as published by the middleware
    pub fn encode(&self) -> Vec<u8> {
        // Only string fields: serialization cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Label used in log lines
    pub fn label(&self) -> String {
        let name = if self.resource_name.is_empty() { "<unnamed>" } else { &self.resource_name };
        let ts = if self.timestamp.is_empty() { "<no timestamp>" } else { &self.timestamp };
        format!("{name}@{ts}")
    }
}

/// Read a key as text; absent or null becomes "", scalars are stringified
pub(crate) fn text_field(object: &Map<String, Value>, key: &str) -> String {
    match object.get(key) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Like `text_field` but keeps "absent" distinct from "empty"
pub(crate) fn optional_text_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
