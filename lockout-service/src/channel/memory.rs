//! In-process event channel and dead-letter sink
//!
//! `MemoryEventLog` keeps every appended event with its ack state. Like a
//! durable consumer, a new subscription first redelivers everything that was
//! delivered but not acknowledged, then streams new appends. Only the most
//! recent subscription receives events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::{
    Acknowledge, DeadLetter, DeadLetterSink, Delivery, DeliveryStream, EventPublisher,
    EventSource, LockoutEvent,
};
use crate::error::{Error, Result};

/// One entry of the in-memory log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedEvent {
    pub sequence: u64,
    pub partition_key: Option<String>,
    pub payload: Vec<u8>,
    pub acked: bool,
}

#[derive(Default)]
struct LogInner {
    entries: Vec<LoggedEvent>,
    subscriber: Option<mpsc::UnboundedSender<Delivery>>,
}

#[derive(Default)]
struct LogShared {
    inner: Mutex<LogInner>,
    reject_publishes: AtomicBool,
    lose_acks: AtomicBool,
}

impl LogShared {
    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Append-only event log held in process memory
#[derive(Clone, Default)]
pub struct MemoryEventLog {
    shared: Arc<LogShared>,
}

struct MemoryAck {
    shared: Arc<LogShared>,
    sequence: u64,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(&self) -> Result<()> {
        if self.shared.lose_acks.load(Ordering::SeqCst) {
            return Err(Error::Nats("connection lost before ack".to_string()));
        }
        let mut inner = self.shared.lock();
        if let Some(entry) = inner
            .entries
            .iter_mut()
            .find(|entry| entry.sequence == self.sequence)
        {
            entry.acked = true;
        }
        Ok(())
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes, bypassing event encoding
    pub fn append_raw(&self, partition_key: Option<&str>, payload: impl Into<Vec<u8>>) -> u64 {
        let mut inner = self.shared.lock();
        let entry = LoggedEvent {
            sequence: inner.entries.len() as u64 + 1,
            partition_key: partition_key.map(str::to_string),
            payload: payload.into(),
            acked: false,
        };
        let sequence = entry.sequence;

        let delivery = self.delivery_for(&entry);
        inner.entries.push(entry);
        if let Some(subscriber) = &inner.subscriber {
            // A closed receiver keeps the entry unacked for the next subscriber
            let _ = subscriber.send(delivery);
        }
        sequence
    }

    /// Snapshot of the whole log
    pub fn entries(&self) -> Vec<LoggedEvent> {
        self.shared.lock().entries.clone()
    }

    /// Decoded events in append order
    pub fn events(&self) -> Vec<LockoutEvent> {
        self.entries()
            .iter()
            .filter_map(|entry| {
                LockoutEvent::decode(entry.partition_key.as_deref(), &entry.payload).ok()
            })
            .collect()
    }

    pub fn unacked(&self) -> usize {
        self.shared
            .lock()
            .entries
            .iter()
            .filter(|entry| !entry.acked)
            .count()
    }

    /// Make `publish` fail, simulating an unreachable channel
    pub fn set_reject_publishes(&self, reject: bool) {
        self.shared.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Make acks fail, simulating a consumer that dies before acknowledging
    pub fn set_lose_acks(&self, lose: bool) {
        self.shared.lose_acks.store(lose, Ordering::SeqCst);
    }

    fn delivery_for(&self, entry: &LoggedEvent) -> Delivery {
        Delivery::new(
            entry.partition_key.clone(),
            entry.payload.clone(),
            Some(entry.sequence),
            Box::new(MemoryAck {
                shared: Arc::clone(&self.shared),
                sequence: entry.sequence,
            }),
        )
    }
}

#[async_trait]
impl EventPublisher for MemoryEventLog {
    async fn publish(&self, event: &LockoutEvent) -> Result<()> {
        if self.shared.reject_publishes.load(Ordering::SeqCst) {
            return Err(Error::Nats("no responders available".to_string()));
        }
        self.append_raw(Some(&event.identity), event.payload.clone());
        Ok(())
    }
}

#[async_trait]
impl EventSource for MemoryEventLog {
    async fn subscribe(&self) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.shared.lock();
            for entry in inner.entries.iter().filter(|entry| !entry.acked) {
                let _ = tx.send(self.delivery_for(entry));
            }
            // Replacing the sender ends the previous subscription's stream
            inner.subscriber = Some(tx);
        }

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }
}

/// Dead-letter sink that keeps letters in memory
#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
    unavailable: AtomicBool,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }

    /// Make every write fail
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Nats("dead-letter stream unavailable".to_string()));
        }
        self.letters
            .lock()
            .map_err(|_| Error::Internal("dead-letter store poisoned".to_string()))?
            .push(letter.clone());
        Ok(())
    }
}
