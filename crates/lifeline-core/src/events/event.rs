//! Server-pushed event envelope

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ChannelError;

/// A named event with a JSON payload
///
/// Types follow `<domain>.<action>`, e.g. `task.updated` or `badge.earned`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ServerEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            id: None,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(|e| ChannelError::Decode(e.to_string()))
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, ChannelError> {
        serde_json::from_slice(bytes).map_err(|e| ChannelError::Decode(e.to_string()))
    }

    /// Part before the first `.`; the whole type if there is none
    pub fn domain(&self) -> &str {
        self.event_type
            .split_once('.')
            .map_or(self.event_type.as_str(), |(domain, _)| domain)
    }

    /// Part after the first `.`
    pub fn action(&self) -> Option<&str> {
        self.event_type.split_once('.').map(|(_, action)| action)
    }
}
