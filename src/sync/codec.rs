//! Encrypted clipboard envelopes
//!
//! A `clipboard_update` payload is `base64(nonce || ciphertext || tag)` over
//! the JSON form of a [`ClipboardItem`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::clipboard::ClipboardItem;
use crate::crypto::{self, CryptoError, SharedKey};
use crate::transport::{MessageType, SyncMessage};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize clipboard item: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to encrypt clipboard item: {0}")]
    Crypto(#[from] CryptoError),
}

/// Reasons an inbound envelope is dropped
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload failed authentication")]
    Authentication,

    #[error("decrypted payload is not a clipboard item: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("expected a clipboard_update envelope, got {0}")]
    UnexpectedType(String),
}

impl From<CryptoError> for DecodeError {
    fn from(_: CryptoError) -> Self {
        DecodeError::Authentication
    }
}

/// Seal `item` for `to_device_id` under `key`
pub fn encode_clipboard_envelope(
    item: &ClipboardItem,
    from_device_id: &str,
    to_device_id: &str,
    key: &SharedKey,
) -> Result<SyncMessage, EncodeError> {
    let plaintext = serde_json::to_vec(item)?;
    let sealed = crypto::encrypt(&plaintext, key)?;

    Ok(SyncMessage::new(
        MessageType::ClipboardUpdate,
        from_device_id,
        Some(to_device_id.to_string()),
        BASE64.encode(sealed),
    ))
}

/// Open a `clipboard_update` envelope with `key`
pub fn decode_clipboard_envelope(
    message: &SyncMessage,
    key: &SharedKey,
) -> Result<ClipboardItem, DecodeError> {
    if message.message_type != MessageType::ClipboardUpdate {
        return Err(DecodeError::UnexpectedType(
            message.message_type.to_string(),
        ));
    }

    let sealed = BASE64.decode(message.payload.as_bytes())?;
    let plaintext = crypto::decrypt(&sealed, key)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_envelope_roundtrip() {
        let key = SharedKey::generate();
        let item = ClipboardItem::text_at("Hello from the laptop", 1_712_345_678_000);

        let message = encode_clipboard_envelope(&item, "laptop", "phone", &key).unwrap();
        assert_eq!(message.message_type, MessageType::ClipboardUpdate);
        assert_eq!(message.from_device_id, "laptop");
        assert_eq!(message.to_device_id.as_deref(), Some("phone"));
        assert!(!message.payload.contains("Hello"));

        let decoded = decode_clipboard_envelope(&message, &key).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_other_devices_key_fails() {
        let item = ClipboardItem::text("secret");
        let message =
            encode_clipboard_envelope(&item, "laptop", "phone", &SharedKey::generate()).unwrap();

        let result = decode_clipboard_envelope(&message, &SharedKey::generate());
        assert!(matches!(result, Err(DecodeError::Authentication)));
    }

    #[test]
    fn test_bad_base64() {
        let mut message = SyncMessage::new(
            MessageType::ClipboardUpdate,
            "a",
            None,
            "not base64!!".to_string(),
        );
        let key = SharedKey::generate();
        assert!(matches!(
            decode_clipboard_envelope(&message, &key),
            Err(DecodeError::Base64(_))
        ));

        message.payload = BASE64.encode([0u8; 10]);
        assert!(matches!(
            decode_clipboard_envelope(&message, &key),
            Err(DecodeError::Authentication)
        ));
    }

    #[test]
    fn test_sealed_non_item_is_malformed() {
        let key = SharedKey::generate();
        let sealed = crypto::encrypt(b"[1, 2, 3]", &key).unwrap();
        let message =
            SyncMessage::new(MessageType::ClipboardUpdate, "a", None, BASE64.encode(sealed));

        assert!(matches!(
            decode_clipboard_envelope(&message, &key),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let message = SyncMessage::ping("a");
        assert!(matches!(
            decode_clipboard_envelope(&message, &SharedKey::generate()),
            Err(DecodeError::UnexpectedType(t)) if t == "ping"
        ));
    }
}
