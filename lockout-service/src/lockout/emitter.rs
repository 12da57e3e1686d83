//! Asynchronous lockout event emission
//!
//! The request path hands events to [`LockoutEmitter::emit`], which never
//! waits on the channel. A single background task drains a bounded FIFO and
//! publishes events in the order they were emitted, so one identity's events
//! reach the channel in emission order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::channel::{EventPublisher, LockoutEvent};

enum Command {
    Publish(LockoutEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle for queueing lockout events
///
/// Cheap to clone. The drain task exits once every handle is dropped and
/// the queue is empty.
#[derive(Clone)]
pub struct LockoutEmitter {
    tx: mpsc::Sender<Command>,
}

impl LockoutEmitter {
    /// Start the drain task
    pub fn spawn(publisher: Arc<dyn EventPublisher>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(drain(rx, publisher));
        (Self { tx }, handle)
    }

    /// Queue an event for publishing without waiting
    ///
    /// A full or closed queue drops the event. The drop is logged as a
    /// durability gap: the attempt cache already holds the lock, but the
    /// durable store will not learn of it until reconciled out-of-band.
    pub fn emit(&self, event: LockoutEvent) {
        if let Err(e) = self.tx.try_send(Command::Publish(event)) {
            let (reason, event) = match e {
                mpsc::error::TrySendError::Full(Command::Publish(event)) => ("queue full", event),
                mpsc::error::TrySendError::Closed(Command::Publish(event)) => {
                    ("emitter stopped", event)
                }
                _ => return,
            };
            error!(
                identity = %event.identity,
                event_id = %event.event_id,
                failed_count = event.failed_count,
                payload = %event.payload_text(),
                durability_gap = true,
                "Lockout event dropped: {}", reason
            );
        }
    }

    /// Wait until every event queued before this call has been handled
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn drain(mut rx: mpsc::Receiver<Command>, publisher: Arc<dyn EventPublisher>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Publish(event) => match publisher.publish(&event).await {
                Ok(()) => debug!(
                    identity = %event.identity,
                    event_id = %event.event_id,
                    failed_count = event.failed_count,
                    "Lockout event published"
                ),
                Err(e) => error!(
                    identity = %event.identity,
                    event_id = %event.event_id,
                    failed_count = event.failed_count,
                    payload = %event.payload_text(),
                    durability_gap = true,
                    error = %e,
                    "Failed to publish lockout event"
                ),
            },
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Lockout emitter drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryEventLog;

    #[tokio::test]
    async fn test_events_published_in_emit_order() {
        let log = MemoryEventLog::new();
        let (emitter, _handle) = LockoutEmitter::spawn(Arc::new(log.clone()), 16);

        for count in 5..10 {
            emitter.emit(LockoutEvent::new("alice", count).unwrap());
        }
        emitter.flush().await;

        let counts: Vec<u32> = log.events().iter().map(|e| e.failed_count).collect();
        assert_eq!(counts, vec![5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_drain() {
        let log = MemoryEventLog::new();
        let (emitter, _handle) = LockoutEmitter::spawn(Arc::new(log.clone()), 16);

        log.set_reject_publishes(true);
        emitter.emit(LockoutEvent::new("alice", 5).unwrap());
        emitter.flush().await;
        assert!(log.entries().is_empty());

        log.set_reject_publishes(false);
        emitter.emit(LockoutEvent::new("bob", 5).unwrap());
        emitter.flush().await;
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.events()[0].identity, "bob");
    }

    #[tokio::test]
    async fn test_drain_exits_when_handles_dropped() {
        let log = MemoryEventLog::new();
        let (emitter, handle) = LockoutEmitter::spawn(Arc::new(log.clone()), 4);
        emitter.emit(LockoutEvent::new("alice", 5).unwrap());
        drop(emitter);

        handle.await.unwrap();
        assert_eq!(log.events().len(), 1);
    }
}
