//! Realtime channel message types
//!
//! JSON text frames, the same schema in both directions:
//!
//! ```text
//! { "type": "create" | "update" | "delete", "file": FileRecord | null, "origin": "<client id>" }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::models::{ChangeEvent, ChangeKind, FileRecord};

/// One change notification on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub kind: ChangeKind,

    #[serde(default)]
    pub file: Option<FileRecord>,

    /// Client that made the change, used to skip our own echoes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ChannelMessage {
    /// Wrap an outbound change
    pub fn from_event(event: &ChangeEvent, origin: &str) -> Self {
        Self {
            kind: event.kind,
            file: Some(event.record.clone()),
            origin: Some(origin.to_string()),
        }
    }

    /// Convert to a change event; a message without a file is malformed
    pub fn into_event(self) -> SyncResult<ChangeEvent> {
        match self.file {
            Some(record) if !record.relative_path.is_empty() => {
                Ok(ChangeEvent::new(self.kind, record))
            }
            _ => Err(SyncError::protocol(
                "channel receive",
                "change notification without a file path",
            )),
        }
    }

    pub fn encode(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::protocol("channel send", e.to_string()))
    }

    pub fn decode(text: &str) -> SyncResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::protocol("channel receive", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_update() {
        let msg = ChannelMessage::decode(
            r#"{"type":"update","file":{"path":"a.md","isDirectory":false,"size":3,
                "modifiedTime":"2024-01-01T00:00:00Z","hash":"h"}}"#,
        )
        .unwrap();

        assert_eq!(msg.kind, ChangeKind::Updated);
        assert!(msg.origin.is_none());
        let event = msg.into_event().unwrap();
        assert_eq!(event.path(), "a.md");
    }

    #[test]
    fn test_null_file_is_protocol_error() {
        let msg = ChannelMessage::decode(r#"{"type":"delete","file":null}"#).unwrap();
        assert!(msg.into_event().is_err());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(ChannelMessage::decode(r#"{"type":"rename","file":null}"#).is_err());
        assert!(ChannelMessage::decode("not json").is_err());
    }

    #[test]
    fn test_outbound_carries_origin() {
        let event = ChangeEvent::deleted("old.md");
        let text = ChannelMessage::from_event(&event, "folio-1234")
            .encode()
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "delete");
        assert_eq!(value["file"]["path"], "old.md");
        assert_eq!(value["origin"], "folio-1234");
    }
}
