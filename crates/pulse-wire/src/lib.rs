// Wire contract for measurement envelopes exchanged over the transport.
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize envelope")]
    Serialize(#[source] serde_json::Error),
    #[error("malformed envelope payload")]
    Deserialize(#[source] serde_json::Error),
    #[error("envelope count must be a positive integer")]
    InvalidCount,
}

/// A single published unit of data: source identity, publish timestamp, and
/// per-source sequence counter.
///
/// Counts start at 1 and strictly increase for the lifetime of a source, so
/// the consumer can detect gaps and reordering. The timestamp is stamped at
/// construction, before the transport sees the message.
///
/// ```
/// use pulse_wire::Envelope;
///
/// let envelope = Envelope::new("producer-1", 1).expect("envelope");
/// let encoded = envelope.encode().expect("encode");
/// let decoded = Envelope::decode(&encoded).expect("decode");
/// assert_eq!(envelope, decoded);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub count: u64,
}

impl Envelope {
    // Stamp the publish time now; sequence assignment belongs to the caller.
    pub fn new(source: impl Into<String>, count: u64) -> Result<Self> {
        Self::with_timestamp(source, Utc::now(), count)
    }

    // Explicit timestamp variant for replay and synthetic-clock tests.
    pub fn with_timestamp(
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
        count: u64,
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::InvalidCount);
        }
        Ok(Self {
            source: source.into(),
            timestamp,
            count,
        })
    }

    pub fn encode(&self) -> Result<Bytes> {
        let payload = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Ok(Bytes::from(payload))
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(input).map_err(Error::Deserialize)?;
        // Zero means the producer never assigned a sequence; reject it here so
        // downstream ordering checks only ever see valid counts.
        if envelope.count == 0 {
            return Err(Error::InvalidCount);
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn round_trip() {
        // Encoding then decoding should preserve every field exactly.
        let envelope = Envelope::new("producer-1", 42).expect("envelope");
        let encoded = envelope.encode().expect("encode");
        let decoded = Envelope::decode(&encoded).expect("decode");
        assert_eq!(envelope, decoded);
    }

    #[test]
    fn wire_format_is_flat_json() {
        let timestamp = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let envelope = Envelope::with_timestamp("producer-1", timestamp, 7).expect("envelope");
        let encoded = envelope.encode().expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&encoded).expect("json");
        assert_eq!(value["source"], "producer-1");
        assert_eq!(value["count"], 7);
        // ISO-8601 UTC string, parseable back to the same instant.
        let raw = value["timestamp"].as_str().expect("timestamp string");
        let parsed: DateTime<Utc> = raw.parse().expect("parse timestamp");
        assert_eq!(parsed, timestamp);
    }

    #[test]
    fn decode_accepts_offset_timestamps() {
        // Producers in other stacks emit +00:00 rather than Z; both are valid.
        let decoded = Envelope::decode(
            br#"{"source":"producer-1","timestamp":"2026-08-01T12:00:00.250000+00:00","count":3}"#,
        )
        .expect("decode");
        assert_eq!(decoded.source, "producer-1");
        assert_eq!(decoded.count, 3);
        assert_eq!(decoded.timestamp.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        let err = Envelope::decode(b"not json at all").expect_err("malformed");
        assert!(matches!(err, Error::Deserialize(_)));
    }

    #[test]
    fn decode_rejects_missing_fields() {
        let err = Envelope::decode(br#"{"source":"producer-1","count":1}"#)
            .expect_err("missing timestamp");
        assert!(matches!(err, Error::Deserialize(_)));
        let err = Envelope::decode(br#"{"timestamp":"2026-08-01T12:00:00Z","count":1}"#)
            .expect_err("missing source");
        assert!(matches!(err, Error::Deserialize(_)));
        let err = Envelope::decode(br#"{"source":"p","timestamp":"2026-08-01T12:00:00Z"}"#)
            .expect_err("missing count");
        assert!(matches!(err, Error::Deserialize(_)));
    }

    #[test]
    fn decode_rejects_zero_count() {
        let err = Envelope::decode(br#"{"source":"p","timestamp":"2026-08-01T12:00:00Z","count":0}"#)
            .expect_err("zero count");
        assert!(matches!(err, Error::InvalidCount));
    }

    #[test]
    fn new_rejects_zero_count() {
        let err = Envelope::new("producer-1", 0).expect_err("zero count");
        assert!(matches!(err, Error::InvalidCount));
    }

    #[test]
    fn sub_millisecond_precision_survives_round_trip() {
        let timestamp = Utc
            .timestamp_opt(1_790_000_000, 123_456_789)
            .single()
            .expect("timestamp");
        let envelope = Envelope::with_timestamp("producer-1", timestamp, 5).expect("envelope");
        let decoded = Envelope::decode(&envelope.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.timestamp, timestamp);
    }
}
