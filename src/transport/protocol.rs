//! Wire protocol definitions for the ClipMirror transport layer
//!
//! Every frame on the wire carries one JSON-encoded [`SyncMessage`]. The
//! envelope is deliberately flat and string-typed so that peers running a
//! newer protocol can introduce message types without breaking older ones.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default TCP port of the sync server
pub const DEFAULT_PORT: u16 = 8765;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message type tag.
///
/// The set is open: anything a peer sends that this build does not know is
/// kept verbatim in [`MessageType::Unknown`] and ignored by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// First envelope after a connection is established
    Handshake,

    /// Keep-alive
    Ping,

    /// Encrypted clipboard snapshot
    ClipboardUpdate,

    /// Any type this build does not understand
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::Ping => "ping",
            MessageType::ClipboardUpdate => "clipboard_update",
            MessageType::Unknown(other) => other,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "handshake" => MessageType::Handshake,
            "ping" => MessageType::Ping,
            "clipboard_update" => MessageType::ClipboardUpdate,
            _ => MessageType::Unknown(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope exchanged between paired devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    /// Message type for routing
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// Device identity of the sender
    pub from_device_id: String,

    /// Intended recipient, absent for handshake and ping
    #[serde(default)]
    pub to_device_id: Option<String>,

    /// Creation time in epoch milliseconds
    pub timestamp: i64,

    /// Opaque payload; base64 sealed box for clipboard updates, empty otherwise
    #[serde(default)]
    pub payload: String,
}

impl SyncMessage {
    /// Create an envelope stamped with the current time
    pub fn new(
        message_type: MessageType,
        from_device_id: impl Into<String>,
        to_device_id: Option<String>,
        payload: String,
    ) -> Self {
        Self {
            message_type,
            from_device_id: from_device_id.into(),
            to_device_id,
            timestamp: now_millis(),
            payload,
        }
    }

    /// Handshake announcing `device_id`
    pub fn handshake(device_id: impl Into<String>) -> Self {
        Self::new(MessageType::Handshake, device_id, None, String::new())
    }

    /// Keep-alive from `device_id`
    pub fn ping(device_id: impl Into<String>) -> Self {
        Self::new(MessageType::Ping, device_id, None, String::new())
    }

    /// Whether the envelope is meant for `device_id`.
    ///
    /// Envelopes without a recipient are broadcast and match every device.
    pub fn is_addressed_to(&self, device_id: &str) -> bool {
        self.to_device_id
            .as_deref()
            .map_or(true, |to| to == device_id)
    }

    /// Serialize to the UTF-8 JSON body carried inside a frame
    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse a frame body
    pub fn from_json_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_handshake_wire_shape() {
        let mut msg = SyncMessage::handshake("device-a");
        msg.timestamp = 1_700_000_000_000;

        let json: serde_json::Value =
            serde_json::from_slice(&msg.to_json_bytes().unwrap()).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "type": "handshake",
                "fromDeviceId": "device-a",
                "toDeviceId": null,
                "timestamp": 1_700_000_000_000i64,
                "payload": ""
            })
        );
    }

    #[test]
    fn test_absent_recipient_and_payload() {
        let raw = br#"{"type":"ping","fromDeviceId":"mac","timestamp":5}"#;
        let msg = SyncMessage::from_json_bytes(raw).unwrap();

        assert_eq!(msg.message_type, MessageType::Ping);
        assert_eq!(msg.to_device_id, None);
        assert_eq!(msg.payload, "");
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let raw = br#"{"type":"file_offer","fromDeviceId":"mac","toDeviceId":"phone","timestamp":5,"payload":"x"}"#;
        let msg = SyncMessage::from_json_bytes(raw).unwrap();

        assert_eq!(msg.message_type, MessageType::Unknown("file_offer".to_string()));

        let reencoded: serde_json::Value =
            serde_json::from_slice(&msg.to_json_bytes().unwrap()).unwrap();
        assert_eq!(reencoded["type"], "file_offer");
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(MessageType::Handshake.to_string(), "handshake");
        assert_eq!(MessageType::ClipboardUpdate.to_string(), "clipboard_update");
        assert_eq!(MessageType::from("ping".to_string()), MessageType::Ping);
    }

    #[test]
    fn test_addressing() {
        let broadcast = SyncMessage::ping("mac");
        assert!(broadcast.is_addressed_to("anyone"));

        let direct = SyncMessage::new(
            MessageType::ClipboardUpdate,
            "mac",
            Some("phone".to_string()),
            String::new(),
        );
        assert!(direct.is_addressed_to("phone"));
        assert!(!direct.is_addressed_to("tablet"));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(SyncMessage::from_json_bytes(b"{not json").is_err());
        assert!(SyncMessage::from_json_bytes(br#"{"type":"ping"}"#).is_err());
    }
}
