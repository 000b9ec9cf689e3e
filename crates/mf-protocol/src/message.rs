//! Timestamped message envelope.
//!
//! Every payload published on the bus is wrapped in a `TimestampedMessage`
//! carrying the wall-clock publish time in epoch milliseconds. Listeners use
//! the timestamp for stale-duplicate suppression, so the serialized shape
//! (`{"message": .., "timestamp": ..}`) is part of the wire contract.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// A payload string paired with its publish timestamp.
///
/// A missing timestamp orders before every present one, so a message that
/// lost its timestamp in transit can never suppress newer traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedMessage {
    #[serde(rename = "message")]
    payload: String,
    #[serde(rename = "timestamp")]
    timestamp_ms: Option<u64>,
}

impl TimestampedMessage {
    pub fn new(payload: impl Into<String>, timestamp_ms: Option<u64>) -> Self {
        TimestampedMessage {
            payload: payload.into(),
            timestamp_ms,
        }
    }

    /// Wrap `payload` with the current wall-clock time.
    pub fn now(payload: impl Into<String>) -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        TimestampedMessage::new(payload, Some(ms))
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn timestamp_ms(&self) -> Option<u64> {
        self.timestamp_ms
    }

    /// Timestamp used for ordering; a missing timestamp is the minimum time.
    pub fn effective_timestamp(&self) -> u64 {
        self.timestamp_ms.unwrap_or(0)
    }

    /// Strictly-later comparison on timestamps.
    pub fn is_after(&self, other: &TimestampedMessage) -> bool {
        self.effective_timestamp() > other.effective_timestamp()
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).expect("message serialization is infallible")
    }

    pub fn deserialize(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::TimestampedMessage;

    #[test]
    fn serialized_shape_is_message_and_timestamp() {
        let msg = TimestampedMessage::new("hello", Some(1234));
        assert_eq!(msg.serialize(), r#"{"message":"hello","timestamp":1234}"#);
    }

    #[test]
    fn round_trip_preserves_payload_and_timestamp() {
        let msg = TimestampedMessage::new(r#"{"channel":"7"}"#, Some(99_000));
        let back = TimestampedMessage::deserialize(&msg.serialize()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn round_trip_preserves_missing_timestamp() {
        let msg = TimestampedMessage::new("x", None);
        let back = TimestampedMessage::deserialize(&msg.serialize()).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.timestamp_ms(), None);
    }

    #[test]
    fn missing_timestamp_orders_before_everything() {
        let old = TimestampedMessage::new("a", None);
        let new = TimestampedMessage::new("b", Some(1));
        assert!(new.is_after(&old));
        assert!(!old.is_after(&new));
        assert!(!old.is_after(&old));
    }
}
