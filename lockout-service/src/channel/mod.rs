//! Lockout event channel
//!
//! An ordered, durable, append-only log of lockout notifications keyed by
//! identity. The coordinator publishes through [`EventPublisher`]; the
//! reconciler consumes [`Delivery`] values from an [`EventSource`] and
//! acknowledges each one only after its durable effects have committed.
//!
//! # Wire format
//!
//! Events are JSON objects:
//!
//! ```json
//! {"event_id":"0190…","identity":"alice","failed_count":5,"emitted_at":"2025-01-01T00:00:00Z"}
//! ```
//!
//! The identity also travels out-of-band as the partition key (the
//! `Lockout-Identity` header on NATS). A payload whose identity disagrees
//! with its partition key is rejected as malformed.
//!
//! Decoding also accepts the older `{"user":"alice","failedCount":5}` shape.
//! Such events get an id derived from their bytes and are stamped with the
//! time they were decoded.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

pub mod jetstream;
pub mod memory;

pub use self::jetstream::{JetStreamDeadLetters, JetStreamPublisher, JetStreamSource};
pub use self::memory::{LoggedEvent, MemoryDeadLetters, MemoryEventLog};

/// Header carrying the partition key
pub const IDENTITY_HEADER: &str = "Lockout-Identity";

/// JSON key the failed-count snapshot is stored under
pub const FAILED_COUNT_KEY: &str = "failed_count";

const LEGACY_FAILED_COUNT_KEY: &str = "failedCount";

/// A lockout notification together with its serialized payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutEvent {
    pub event_id: Uuid,
    pub identity: String,
    pub failed_count: u32,
    pub emitted_at: DateTime<Utc>,
    /// Exact bytes appended to the channel
    pub payload: Vec<u8>,
}

#[derive(Serialize)]
struct EventBody {
    event_id: Uuid,
    identity: String,
    failed_count: u32,
    emitted_at: DateTime<Utc>,
}

/// Fields read back on decode; the count goes through [`parse_failed_count`]
#[derive(Deserialize)]
struct ReceivedBody {
    event_id: Option<Uuid>,
    #[serde(alias = "user")]
    identity: String,
    emitted_at: Option<DateTime<Utc>>,
}

/// Id for payloads that carry none; every redelivery maps to the same one
fn derived_event_id(payload: &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&blake3::hash(payload).as_bytes()[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

impl LockoutEvent {
    /// Build and serialize a new event
    pub fn new(identity: impl Into<String>, failed_count: u32) -> Result<Self> {
        let body = EventBody {
            event_id: Uuid::now_v7(),
            identity: identity.into(),
            failed_count,
            emitted_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| Error::Internal(format!("Failed to serialize lockout event: {}", e)))?;

        Ok(Self {
            event_id: body.event_id,
            identity: body.identity,
            failed_count: body.failed_count,
            emitted_at: body.emitted_at,
            payload,
        })
    }

    /// Decode a payload received under `partition_key`
    pub fn decode(partition_key: Option<&str>, payload: &[u8]) -> Result<Self> {
        let failed_count = parse_failed_count(payload)?;
        let body: ReceivedBody = serde_json::from_slice(payload)?;

        if let Some(key) = partition_key {
            if key != body.identity {
                return Err(Error::MalformedEvent(format!(
                    "payload identity '{}' does not match partition key '{}'",
                    body.identity, key
                )));
            }
        }

        Ok(Self {
            event_id: body.event_id.unwrap_or_else(|| derived_event_id(payload)),
            identity: body.identity,
            failed_count,
            emitted_at: body.emitted_at.unwrap_or_else(Utc::now),
            payload: payload.to_vec(),
        })
    }

    /// Payload as text for the audit trail
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Extract the failed-count snapshot from a payload
///
/// Reads `failed_count`, or `failedCount` from older producers. Fails when
/// neither is present or the value is not an integer in `0..=u32::MAX`.
/// Never falls back to a default.
pub fn parse_failed_count(payload: &[u8]) -> Result<u32> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    let (key, raw) = [FAILED_COUNT_KEY, LEGACY_FAILED_COUNT_KEY]
        .into_iter()
        .find_map(|key| value.get(key).map(|raw| (key, raw)))
        .ok_or_else(|| Error::MalformedEvent(format!("payload has no '{}'", FAILED_COUNT_KEY)))?;

    let count = raw.as_u64().ok_or_else(|| {
        Error::MalformedEvent(format!("'{}' is not a non-negative integer: {}", key, raw))
    })?;

    u32::try_from(count)
        .map_err(|_| Error::MalformedEvent(format!("'{}' out of range: {}", key, count)))
}

/// Stable partition token for an identity, safe to embed in a subject
pub fn partition_token(identity: &str) -> String {
    blake3::hash(identity.as_bytes()).to_hex().to_string()
}

/// Publishes lockout events to the channel
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    /// Append the event; returns once the channel has durably accepted it
    async fn publish(&self, event: &LockoutEvent) -> Result<()>;
}

/// Acknowledges one delivery back to the channel
///
/// Both calls may be repeated until one succeeds.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;

    /// Ask the channel to hold off redelivery while the event is still being worked on
    async fn progress(&self) -> Result<()> {
        Ok(())
    }
}

/// One event handed to the reconciler
pub struct Delivery {
    /// Partition key the event was published under, when the channel carries one
    pub partition_key: Option<String>,
    pub payload: Vec<u8>,
    /// Channel-assigned position, recorded in the audit trail
    pub sequence: Option<u64>,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        partition_key: Option<String>,
        payload: Vec<u8>,
        sequence: Option<u64>,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            partition_key,
            payload,
            sequence,
            acker,
        }
    }

    /// Confirm processing; the channel will not redeliver this event
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// Extend the redelivery deadline of an event that is still held
    pub async fn progress(&self) -> Result<()> {
        self.acker.progress().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("partition_key", &self.partition_key)
            .field("payload_len", &self.payload.len())
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Stream of deliveries; an `Err` item is a receive failure, not an event failure
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Source of deliveries for the reconciler
///
/// A fresh subscription redelivers every event that was delivered earlier
/// but never acknowledged.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    async fn subscribe(&self) -> Result<DeliveryStream>;
}

/// Why an event was set aside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The payload could not be decoded
    Malformed,
    /// The store rejected the event with a non-retriable error
    Permanent,
    /// A retriable store error persisted through every retry
    TransientExhausted,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed"),
            Self::Permanent => write!(f, "permanent"),
            Self::TransientExhausted => write!(f, "transient_exhausted"),
        }
    }
}

/// An event that could not be applied, kept for operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub reason: DeadLetterReason,
    pub error: String,
    pub partition_key: Option<String>,
    pub payload: Vec<u8>,
    pub sequence: Option<u64>,
}

/// Destination for dead-lettered events
#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_event_payload_embeds_count() {
        let event = LockoutEvent::new("alice", 5).unwrap();
        assert_eq!(parse_failed_count(&event.payload).unwrap(), 5);
        assert!(event.payload_text().contains("\"identity\":\"alice\""));
    }

    #[test]
    fn test_decode_preserves_fields() {
        let event = LockoutEvent::new("alice", 7).unwrap();
        let decoded = LockoutEvent::decode(Some("alice"), &event.payload).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_parse_failed_count_rejects_missing_key() {
        let err = parse_failed_count(br#"{"identity":"alice"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(_)));
        assert!(err.to_string().contains("failed_count"));
    }

    #[test]
    fn test_parse_failed_count_rejects_bad_values() {
        for payload in [
            &br#"{"failed_count":"5"}"#[..],
            br#"{"failed_count":-1}"#,
            br#"{"failed_count":2.5}"#,
            br#"{"failed_count":null}"#,
            br#"{"failed_count":4294967296}"#,
            b"not json",
        ] {
            let err = parse_failed_count(payload).unwrap_err();
            assert!(matches!(err, Error::MalformedEvent(_)), "{:?}", err);
        }
    }

    #[test]
    fn test_decode_accepts_legacy_shape() {
        let payload = br#"{"user":"alice","failedCount":5}"#;
        let event = LockoutEvent::decode(Some("alice"), payload).unwrap();
        assert_eq!(event.identity, "alice");
        assert_eq!(event.failed_count, 5);

        let again = LockoutEvent::decode(Some("alice"), payload).unwrap();
        assert_eq!(again.event_id, event.event_id);
        assert_ne!(
            LockoutEvent::decode(None, br#"{"user":"alice","failedCount":6}"#)
                .unwrap()
                .event_id,
            event.event_id
        );
    }

    #[test]
    fn test_legacy_count_is_validated_too() {
        let err = parse_failed_count(br#"{"user":"alice","failedCount":"5"}"#).unwrap_err();
        assert!(err.to_string().contains("failedCount"));
    }

    #[test]
    fn test_decode_rejects_partition_mismatch() {
        let event = LockoutEvent::new("alice", 5).unwrap();
        let err = LockoutEvent::decode(Some("mallory"), &event.payload).unwrap_err();
        assert!(matches!(err, Error::MalformedEvent(_)));
    }

    #[test]
    fn test_decode_rejects_missing_identity() {
        let err = LockoutEvent::decode(None, br#"{"failed_count":5}"#).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_partition_token_is_stable_hex() {
        let token = partition_token("user@example.com");
        assert_eq!(token, partition_token("user@example.com"));
        assert_ne!(token, partition_token("other@example.com"));
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_dead_letter_reason_names() {
        assert_eq!(DeadLetterReason::TransientExhausted.to_string(), "transient_exhausted");
        assert_eq!(
            serde_json::to_string(&DeadLetterReason::Malformed).unwrap(),
            "\"malformed\""
        );
    }
}
