//! NATS JetStream event channel
//!
//! Events are published to `{subject_prefix}.{partition_token}` on a durable
//! stream and consumed through a durable pull consumer with explicit acks.
//! JetStream deduplicates on the `Nats-Msg-Id` header, which carries the
//! event id, so publisher retries within the duplicate window append once.

use std::time::Duration;

use async_nats::header::{HeaderMap, NATS_MESSAGE_ID};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, stream, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use super::{
    partition_token, Acknowledge, DeadLetter, DeadLetterSink, Delivery, DeliveryStream,
    EventPublisher, EventSource, LockoutEvent, IDENTITY_HEADER,
};
use crate::config::NatsConfig;
use crate::error::{Error, Result};

const REASON_HEADER: &str = "Lockout-Dead-Letter-Reason";
const ERROR_HEADER: &str = "Lockout-Error";
const SEQUENCE_HEADER: &str = "Lockout-Stream-Sequence";

fn nats_error(action: &str, err: impl std::fmt::Display) -> Error {
    Error::Nats(format!("{}: {}", action, err))
}

/// Create the event and dead-letter streams if they do not exist
pub async fn ensure_streams(context: &jetstream::Context, config: &NatsConfig) -> Result<()> {
    context
        .get_or_create_stream(stream::Config {
            name: config.stream.clone(),
            subjects: vec![format!("{}.>", config.subject_prefix)],
            ..Default::default()
        })
        .await
        .map_err(|e| nats_error(&format!("Failed to create stream {}", config.stream), e))?;

    context
        .get_or_create_stream(stream::Config {
            name: config.dead_letter_stream.clone(),
            subjects: vec![config.dead_letter_subject.clone()],
            ..Default::default()
        })
        .await
        .map_err(|e| {
            nats_error(
                &format!("Failed to create stream {}", config.dead_letter_stream),
                e,
            )
        })?;

    info!(
        stream = %config.stream,
        dead_letter_stream = %config.dead_letter_stream,
        "JetStream streams ready"
    );
    Ok(())
}

/// Publishes lockout events to JetStream
#[derive(Clone)]
pub struct JetStreamPublisher {
    context: jetstream::Context,
    subject_prefix: String,
}

impl JetStreamPublisher {
    pub fn new(context: jetstream::Context, config: &NatsConfig) -> Self {
        Self {
            context,
            subject_prefix: config.subject_prefix.clone(),
        }
    }

    fn subject_for(&self, identity: &str) -> String {
        format!("{}.{}", self.subject_prefix, partition_token(identity))
    }
}

#[async_trait]
impl EventPublisher for JetStreamPublisher {
    async fn publish(&self, event: &LockoutEvent) -> Result<()> {
        let subject = self.subject_for(&event.identity);

        let mut headers = HeaderMap::new();
        headers.insert(IDENTITY_HEADER, event.identity.as_str());
        headers.insert(NATS_MESSAGE_ID, event.event_id.to_string().as_str());

        // The first await sends; the second waits for the stream to persist it
        let ack = self
            .context
            .publish_with_headers(subject.clone(), headers, event.payload.clone().into())
            .await
            .map_err(|e| nats_error(&format!("Failed to publish to {}", subject), e))?;
        let ack = ack
            .await
            .map_err(|e| nats_error(&format!("Stream did not confirm {}", subject), e))?;

        debug!(
            identity = %event.identity,
            event_id = %event.event_id,
            stream_sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Lockout event persisted"
        );
        Ok(())
    }
}

/// Consumes lockout events through a durable pull consumer
#[derive(Clone)]
pub struct JetStreamSource {
    context: jetstream::Context,
    stream: String,
    consumer: String,
    ack_wait: Duration,
    max_ack_pending: Option<i64>,
}

impl JetStreamSource {
    pub fn new(context: jetstream::Context, config: &NatsConfig) -> Self {
        Self {
            context,
            stream: config.stream.clone(),
            consumer: config.consumer.clone(),
            ack_wait: Duration::from_secs(config.ack_wait_secs),
            max_ack_pending: None,
        }
    }

    /// Cap unacknowledged deliveries so none sits queued past its ack deadline
    ///
    /// Pass the reconciler's [`max_in_flight`](crate::reconciler::ReconcilerConfig::max_in_flight).
    pub fn with_max_ack_pending(mut self, max_ack_pending: usize) -> Self {
        self.max_ack_pending = Some(i64::try_from(max_ack_pending).unwrap_or(i64::MAX));
        self
    }

    fn consumer_config(&self) -> pull::Config {
        let mut config = pull::Config {
            durable_name: Some(self.consumer.clone()),
            ack_policy: AckPolicy::Explicit,
            ack_wait: self.ack_wait,
            ..Default::default()
        };
        if let Some(max_ack_pending) = self.max_ack_pending {
            config.max_ack_pending = max_ack_pending;
        }
        config
    }
}

struct JetStreamAck(jetstream::Message);

#[async_trait]
impl Acknowledge for JetStreamAck {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack()
            .await
            .map_err(|e| nats_error("Failed to acknowledge event", e))
    }

    async fn progress(&self) -> Result<()> {
        self.0
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| nats_error("Failed to extend ack deadline", e))
    }
}

fn into_delivery(message: jetstream::Message) -> Delivery {
    let partition_key = message
        .headers
        .as_ref()
        .and_then(|headers| headers.get(IDENTITY_HEADER))
        .map(|value| value.as_str().to_string());
    let sequence = message.info().ok().map(|info| info.stream_sequence);
    let payload = message.payload.to_vec();

    Delivery::new(partition_key, payload, sequence, Box::new(JetStreamAck(message)))
}

#[async_trait]
impl EventSource for JetStreamSource {
    async fn subscribe(&self) -> Result<DeliveryStream> {
        let stream = self
            .context
            .get_stream(&self.stream)
            .await
            .map_err(|e| nats_error(&format!("Failed to open stream {}", self.stream), e))?;

        let consumer = stream
            .get_or_create_consumer(&self.consumer, self.consumer_config())
            .await
            .map_err(|e| nats_error(&format!("Failed to create consumer {}", self.consumer), e))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| nats_error("Failed to start consuming", e))?;

        info!(stream = %self.stream, consumer = %self.consumer, "Subscribed to lockout events");

        Ok(messages
            .map(|item| match item {
                Ok(message) => Ok(into_delivery(message)),
                Err(e) => Err(nats_error("Failed to receive event", e)),
            })
            .boxed())
    }
}

/// Dead-letter sink publishing to a JetStream subject
#[derive(Clone)]
pub struct JetStreamDeadLetters {
    context: jetstream::Context,
    subject: String,
}

impl JetStreamDeadLetters {
    pub fn new(context: jetstream::Context, config: &NatsConfig) -> Self {
        Self {
            context,
            subject: config.dead_letter_subject.clone(),
        }
    }
}

/// Header values must stay on one line
fn header_safe(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[async_trait]
impl DeadLetterSink for JetStreamDeadLetters {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert(REASON_HEADER, letter.reason.to_string().as_str());
        headers.insert(ERROR_HEADER, header_safe(&letter.error).as_str());
        if let Some(key) = &letter.partition_key {
            headers.insert(IDENTITY_HEADER, key.as_str());
        }
        if let Some(sequence) = letter.sequence {
            headers.insert(SEQUENCE_HEADER, sequence.to_string().as_str());
        }

        let ack = self
            .context
            .publish_with_headers(self.subject.clone(), headers, letter.payload.clone().into())
            .await
            .map_err(|e| nats_error("Failed to publish dead letter", e))?;
        ack.await
            .map_err(|e| nats_error("Dead-letter stream did not confirm", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_safe_strips_newlines() {
        assert_eq!(header_safe("line one\nline two\r\n"), "line one line two  ");
    }

    #[test]
    fn test_subject_uses_partition_token() {
        let prefix = NatsConfig::default().subject_prefix;
        let subject = format!("{}.{}", prefix, partition_token("alice"));
        assert!(subject.starts_with("lockout.events."));
        assert!(!subject.contains("alice"));
    }
}
