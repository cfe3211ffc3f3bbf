//! Acknowledgement messages sent by the receiver.
//!
//! The canonical encoding is a small JSON object, `{"ack_num": N}`, carried as
//! the whole UDP payload.  `N` is cumulative: every sequence number up to and
//! including `N` has been delivered.  Receivers report `-1` before the first
//! packet arrives, so the field is signed.
//!
//! Older receivers emit loosely quoted text such as `{'ack_num':3}`.
//! [`AckMessage::decode`] falls back to a text scan for those; the scan is a
//! compatibility shim, not part of the contract.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One cumulative acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub ack_num: i64,
}

/// Errors that can arise when parsing an ACK datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AckError {
    #[error("malformed ACK payload: {0:?}")]
    Malformed(String),
}

const FIELD: &str = "ack_num";

impl AckMessage {
    pub fn new(ack_num: i64) -> Self {
        Self { ack_num }
    }

    /// Serialise into the canonical `{"ack_num": N}` form.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self)
            .unwrap_or_else(|_| format!("{{\"{FIELD}\":{}}}", self.ack_num).into_bytes())
    }

    /// Parse an ACK datagram, JSON first, then the legacy text scan.
    pub fn decode(buf: &[u8]) -> Result<Self, AckError> {
        if let Ok(msg) = serde_json::from_slice::<AckMessage>(buf) {
            return Ok(msg);
        }
        let text = String::from_utf8_lossy(buf);
        legacy_scan(&text).ok_or_else(|| AckError::Malformed(text.chars().take(60).collect()))
    }
}

/// Find `ack_num` and read the first signed decimal run after it.
fn legacy_scan(text: &str) -> Option<AckMessage> {
    let start = text.find(FIELD)? + FIELD.len();
    let rest = &text[start..];

    let digits_at = rest.find(|c: char| c.is_ascii_digit())?;
    let negative = rest[..digits_at].trim_end().ends_with('-');
    let digits: String = rest[digits_at..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();

    let value: i64 = digits.parse().ok()?;
    Some(AckMessage::new(if negative { -value } else { value }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_canonical_json() {
        assert_eq!(AckMessage::new(3).encode(), br#"{"ack_num":3}"#.to_vec());
    }

    #[test]
    fn decodes_canonical_json_with_spacing() {
        let msg = AckMessage::decode(br#"{"ack_num": 12}"#).unwrap();
        assert_eq!(msg.ack_num, 12);
    }

    #[test]
    fn decodes_negative_json() {
        assert_eq!(AckMessage::decode(br#"{"ack_num":-1}"#).unwrap().ack_num, -1);
    }

    #[test]
    fn legacy_single_quoted_text() {
        assert_eq!(AckMessage::decode(b"{'ack_num':7}").unwrap().ack_num, 7);
        assert_eq!(AckMessage::decode(b"{'ack_num':-1}").unwrap().ack_num, -1);
    }

    #[test]
    fn legacy_scan_ignores_digits_after_the_value() {
        let msg = AckMessage::decode(b"ack_num=42 window=5").unwrap();
        assert_eq!(msg.ack_num, 42);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(AckMessage::decode(b"").is_err());
        assert!(AckMessage::decode(b"hello 12").is_err());
        assert!(AckMessage::decode(b"{'ack_num':}").is_err());
        assert!(AckMessage::decode(&[0xff, 0xfe, 0x00]).is_err());
    }
}
