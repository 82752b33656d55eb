//! Wire codec for the client link.
//!
//! Each frame is `{type, payload}` JSON, one message per frame. The codec
//! rejects oversize frames, malformed JSON, unknown top-level fields, and
//! chat text over 500 characters, all without panicking — every decode path
//! returns a typed [`DecodeError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_FRAME_CAP_BYTES: usize = 64 * 1024;
pub const MAX_CHAT_TEXT_LEN: usize = 500;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame of {size} bytes exceeds the {cap} byte cap")]
    TooLarge { size: usize, cap: usize },

    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("chat text of {len} chars exceeds the {max} char cap")]
    TextTooLong { len: usize, max: usize },

    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// The envelope every client frame and every server push is wrapped in.
/// `#[serde(deny_unknown_fields)]` on the envelope gives the strict
/// unknown-top-level-field rejection the wire codec requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Decode one frame from raw bytes, enforcing the size cap before attempting
/// to parse JSON at all.
pub fn decode_frame(bytes: &[u8], cap: usize) -> Result<Frame, DecodeError> {
    if bytes.len() > cap {
        return Err(DecodeError::TooLarge {
            size: bytes.len(),
            cap,
        });
    }
    serde_json::from_slice(bytes).map_err(|e| DecodeError::MalformedJson(e.to_string()))
}

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    // Frames we construct ourselves always serialize; a failure here would be
    // a bug in a hand-built payload, not a decode-path condition.
    serde_json::to_vec(frame).expect("outbound frame must serialize")
}

/// Validates a chat message's text length at the codec boundary, ahead of
/// ever constructing a room `Operation`.
pub fn check_chat_text_len(text: &str) -> Result<(), DecodeError> {
    if text.chars().count() > MAX_CHAT_TEXT_LEN {
        return Err(DecodeError::TextTooLong {
            len: text.chars().count(),
            max: MAX_CHAT_TEXT_LEN,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_well_formed_frame() {
        let raw = br#"{"type":"ROOM_JOIN","payload":{"roomCode":"ABC123"}}"#;
        let frame = decode_frame(raw, DEFAULT_FRAME_CAP_BYTES).unwrap();
        assert_eq!(frame.kind, "ROOM_JOIN");
    }

    #[test]
    fn rejects_oversize_frame() {
        let raw = vec![b'a'; 100];
        let err = decode_frame(&raw, 10).unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge { size: 100, cap: 10 }));
    }

    #[test]
    fn rejects_malformed_json() {
        let raw = b"not json";
        let err = decode_frame(raw, DEFAULT_FRAME_CAP_BYTES).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedJson(_)));
    }

    #[test]
    fn rejects_unknown_top_level_field() {
        let raw = br#"{"type":"ROOM_JOIN","payload":{},"extra":1}"#;
        let err = decode_frame(raw, DEFAULT_FRAME_CAP_BYTES).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedJson(_)));
    }

    #[test]
    fn chat_text_exactly_500_chars_is_accepted() {
        let text = "a".repeat(500);
        assert!(check_chat_text_len(&text).is_ok());
    }

    #[test]
    fn chat_text_501_chars_is_rejected() {
        let text = "a".repeat(501);
        let err = check_chat_text_len(&text).unwrap_err();
        assert!(matches!(err, DecodeError::TextTooLong { len: 501, max: 500 }));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frame = Frame {
            kind: "CHAT_MESSAGE".to_string(),
            payload: serde_json::json!({"roomCode": "ABC123", "messageText": "hi"}),
        };
        let bytes = encode_frame(&frame);
        let decoded = decode_frame(&bytes, DEFAULT_FRAME_CAP_BYTES).unwrap();
        assert_eq!(decoded.kind, frame.kind);
        assert_eq!(decoded.payload, frame.payload);
    }
}
