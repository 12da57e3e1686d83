//! Event reconciliation
//!
//! Drains the lockout event channel into the account store. Each delivery is
//! decoded, applied in one store transaction (account update plus audit row)
//! and acknowledged only after the transaction commits. A crash between
//! commit and ack redelivers the event; the account update is idempotent and
//! the audit trail gains a duplicate row.
//!
//! Deliveries are partitioned across sequential lanes by a hash of the
//! identity, so one identity's events apply strictly in channel order while
//! different identities proceed in parallel. A failing event is retried or
//! dead-lettered on its own and never stops the loop. An event that can be
//! neither acknowledged nor dead-lettered holds its lane until it can, and a
//! redelivered copy behind a position the lane already settled is
//! acknowledged without being applied again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::account::{AccountStore, ApplyOutcome, EventMeta};
use crate::channel::{
    DeadLetter, DeadLetterReason, DeadLetterSink, Delivery, EventSource, LockoutEvent,
};
use crate::error::{Error, Result};

pub mod config;
pub mod retry;

pub use config::ReconcilerConfig;
pub use retry::Backoff;

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Durable effects committed and the delivery was acknowledged
    Applied,
    /// Set aside on the dead-letter sink and acknowledged
    DeadLettered(DeadLetterReason),
    /// A redelivered copy at or behind a position already settled for its
    /// identity; acknowledged without touching the store
    Stale,
    /// Not yet acknowledged
    Deferred,
}

/// Running counters for one reconciler
#[derive(Debug, Default)]
pub struct ReconcilerStats {
    applied: AtomicU64,
    dead_lettered: AtomicU64,
    stale: AtomicU64,
    deferred: AtomicU64,
}

/// Point-in-time copy of [`ReconcilerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub applied: u64,
    pub dead_lettered: u64,
    pub stale: u64,
    pub deferred: u64,
}

impl ReconcilerStats {
    fn record(&self, outcome: ReconcileOutcome) {
        let counter = match outcome {
            ReconcileOutcome::Applied => &self.applied,
            ReconcileOutcome::DeadLettered(_) => &self.dead_lettered,
            ReconcileOutcome::Stale => &self.stale,
            ReconcileOutcome::Deferred => &self.deferred,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }
}

/// The step a delivery still owes before it can be acknowledged
#[derive(Debug)]
enum Pending {
    /// Settled as the given outcome; only the ack is missing
    Ack(ReconcileOutcome),
    /// Not applied; must reach the dead-letter sink first
    DeadLetter(DeadLetter),
}

/// Highest settled channel position per identity, for one lane
#[derive(Debug, Default)]
struct SettledPositions(HashMap<String, u64>);

impl SettledPositions {
    fn covers(&self, delivery: &Delivery) -> bool {
        match (&delivery.partition_key, delivery.sequence) {
            (Some(key), Some(sequence)) => self.0.get(key).is_some_and(|last| sequence <= *last),
            _ => false,
        }
    }

    fn record(&mut self, delivery: &Delivery) {
        if let (Some(key), Some(sequence)) = (&delivery.partition_key, delivery.sequence) {
            let last = self.0.entry(key.clone()).or_insert(sequence);
            *last = (*last).max(sequence);
        }
    }
}

/// Applies lockout events to the account store
pub struct Reconciler {
    config: ReconcilerConfig,
    backoff: Backoff,
    accounts: Arc<dyn AccountStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    stats: ReconcilerStats,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        accounts: Arc<dyn AccountStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            backoff: Backoff::from_config(&config),
            config,
            accounts,
            dead_letters,
            stats: ReconcilerStats::default(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Lane a partition key is pinned to
    pub fn lane_for(&self, partition_key: Option<&str>) -> usize {
        let lanes = self.config.lanes.max(1);
        match partition_key {
            Some(key) => {
                let hash = blake3::hash(key.as_bytes());
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&hash.as_bytes()[..8]);
                (u64::from_le_bytes(prefix) % lanes as u64) as usize
            }
            None => 0,
        }
    }

    /// Decode, apply and acknowledge one delivery in a single pass
    ///
    /// A delivery that cannot be released comes back as
    /// [`ReconcileOutcome::Deferred`] and stays unacknowledged.
    pub async fn process(&self, delivery: Delivery) -> ReconcileOutcome {
        let outcome = self
            .settle(&delivery)
            .await
            .unwrap_or(ReconcileOutcome::Deferred);
        self.stats.record(outcome);
        outcome
    }

    async fn settle(&self, delivery: &Delivery) -> std::result::Result<ReconcileOutcome, Pending> {
        let decoded = LockoutEvent::decode(delivery.partition_key.as_deref(), &delivery.payload);
        let event = match decoded {
            Ok(event) => event,
            Err(e) => {
                let letter = dead_letter_for(delivery, DeadLetterReason::Malformed, &e);
                return self.set_aside(delivery, letter).await;
            }
        };

        if let Err((reason, e)) = self.apply_with_retry(&event, delivery).await {
            let letter = dead_letter_for(delivery, reason, &e);
            return self.set_aside(delivery, letter).await;
        }

        debug!(
            identity = %event.identity,
            event_id = %event.event_id,
            failed_count = event.failed_count,
            "Lockout event applied"
        );
        self.acknowledge(delivery, ReconcileOutcome::Applied).await
    }

    async fn apply_with_retry(
        &self,
        event: &LockoutEvent,
        delivery: &Delivery,
    ) -> std::result::Result<(), (DeadLetterReason, Error)> {
        let meta = EventMeta {
            event_id: Some(event.event_id),
            stream_sequence: delivery.sequence,
        };
        let raw_payload = event.payload_text();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self
                .accounts
                .apply_lockout(&event.identity, event.failed_count, &raw_payload, meta)
                .await;

            match result {
                Ok(ApplyOutcome::Locked) => return Ok(()),
                Ok(ApplyOutcome::MissingAccount) => {
                    warn!(
                        identity = %event.identity,
                        event_id = %event.event_id,
                        "Lockout event for unknown account; audit row written, no account changed"
                    );
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.backoff.max_attempts() => {
                    let delay = self.backoff.delay_for(attempt);
                    warn!(
                        identity = %event.identity,
                        attempt = attempt,
                        max_attempts = self.backoff.max_attempts(),
                        error = %e,
                        "Transient store error applying lockout event. Retrying in {:?}...",
                        delay
                    );
                    extend_deadline(delivery).await;
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err((DeadLetterReason::TransientExhausted, e));
                }
                Err(e) => return Err((DeadLetterReason::Permanent, e)),
            }
        }
    }

    async fn set_aside(
        &self,
        delivery: &Delivery,
        letter: DeadLetter,
    ) -> std::result::Result<ReconcileOutcome, Pending> {
        if let Err(e) = self.dead_letters.dead_letter(&letter).await {
            error!(
                partition_key = ?letter.partition_key,
                sequence = ?letter.sequence,
                reason = %letter.reason,
                cause = %letter.error,
                error = %e,
                "Failed to dead-letter event; holding it unacknowledged"
            );
            return Err(Pending::DeadLetter(letter));
        }

        warn!(
            partition_key = ?letter.partition_key,
            sequence = ?letter.sequence,
            reason = %letter.reason,
            cause = %letter.error,
            "Lockout event dead-lettered"
        );
        self.acknowledge(delivery, ReconcileOutcome::DeadLettered(letter.reason))
            .await
    }

    async fn acknowledge(
        &self,
        delivery: &Delivery,
        outcome: ReconcileOutcome,
    ) -> std::result::Result<ReconcileOutcome, Pending> {
        match delivery.ack().await {
            Ok(()) => Ok(outcome),
            Err(e) => {
                warn!(
                    partition_key = ?delivery.partition_key,
                    sequence = ?delivery.sequence,
                    outcome = ?outcome,
                    error = %e,
                    "Settled lockout event but ack failed; holding it"
                );
                Err(Pending::Ack(outcome))
            }
        }
    }

    async fn resume(
        &self,
        delivery: &Delivery,
        pending: Pending,
    ) -> std::result::Result<ReconcileOutcome, Pending> {
        match pending {
            Pending::Ack(outcome) => self.acknowledge(delivery, outcome).await,
            Pending::DeadLetter(letter) => self.set_aside(delivery, letter).await,
        }
    }

    /// Retry the missing step of a stuck delivery until it settles
    ///
    /// Returns `None` on shutdown, leaving the delivery unacknowledged.
    async fn hold(
        &self,
        delivery: &Delivery,
        mut pending: Pending,
        shutdown: &CancellationToken,
    ) -> Option<ReconcileOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            extend_deadline(delivery).await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.backoff.delay_for(attempt)) => {}
            }

            match self.resume(delivery, pending).await {
                Ok(outcome) => {
                    info!(
                        sequence = ?delivery.sequence,
                        attempt = attempt,
                        outcome = ?outcome,
                        "Held lockout event released"
                    );
                    return Some(outcome);
                }
                Err(still) => pending = still,
            }
        }
    }

    /// Consume `source` until `shutdown` fires
    ///
    /// Each lane finishes the event it is working on before exiting, unless
    /// that event is held, in which case it stays unacknowledged. Queued
    /// deliveries that never started stay unacknowledged as well and are
    /// redelivered to the next subscriber.
    pub async fn run(
        self: Arc<Self>,
        source: Arc<dyn EventSource>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let lanes = self.config.lanes.max(1);
        let mut senders = Vec::with_capacity(lanes);
        let mut workers = JoinSet::new();

        for lane in 0..lanes {
            let (tx, rx) = mpsc::channel(self.config.lane_queue_capacity.max(1));
            senders.push(tx);
            workers.spawn(Arc::clone(&self).lane(lane, rx, shutdown.clone()));
        }

        info!(lanes = lanes, "Reconciler started");
        let result = self.dispatch(source.as_ref(), &senders, &shutdown).await;

        drop(senders);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Reconciler lane panicked");
            }
        }

        let stats = self.stats();
        info!(
            applied = stats.applied,
            dead_lettered = stats.dead_lettered,
            stale = stats.stale,
            deferred = stats.deferred,
            "Reconciler stopped"
        );
        result
    }

    async fn dispatch(
        &self,
        source: &dyn EventSource,
        senders: &[mpsc::Sender<Delivery>],
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let mut failures = 0;

        while !shutdown.is_cancelled() {
            let mut stream = match source.subscribe().await {
                Ok(stream) => {
                    failures = 0;
                    stream
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.backoff.delay_for(failures);
                    warn!(error = %e, "Subscribe failed. Retrying in {:?}...", delay);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Ok(()),
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        let lane = self.lane_for(delivery.partition_key.as_deref());
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => return Ok(()),
                            sent = senders[lane].send(delivery) => {
                                if sent.is_err() {
                                    return Err(Error::Internal(format!(
                                        "reconciler lane {} stopped",
                                        lane
                                    )));
                                }
                            }
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "Failed to receive lockout event"),
                    None => {
                        warn!("Event subscription ended; resubscribing");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Settle deliveries strictly one after another
    ///
    /// A delivery that cannot be released blocks the lane until it is, so a
    /// later event for the same identity never overtakes it.
    async fn lane(
        self: Arc<Self>,
        lane: usize,
        mut rx: mpsc::Receiver<Delivery>,
        shutdown: CancellationToken,
    ) {
        let mut settled = SettledPositions::default();

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let first = if settled.covers(&delivery) {
                debug!(
                    lane = lane,
                    partition_key = ?delivery.partition_key,
                    sequence = ?delivery.sequence,
                    "Skipping redelivered lockout event already settled"
                );
                self.acknowledge(&delivery, ReconcileOutcome::Stale).await
            } else {
                self.settle(&delivery).await
            };

            let outcome = match first {
                Ok(outcome) => outcome,
                Err(pending) => {
                    self.stats.record(ReconcileOutcome::Deferred);
                    match self.hold(&delivery, pending, &shutdown).await {
                        Some(outcome) => outcome,
                        None => break,
                    }
                }
            };

            self.stats.record(outcome);
            settled.record(&delivery);
            debug!(lane = lane, sequence = ?delivery.sequence, outcome = ?outcome, "Delivery settled");
        }
        debug!(lane = lane, "Reconciler lane stopped");
    }
}

fn dead_letter_for(delivery: &Delivery, reason: DeadLetterReason, cause: &Error) -> DeadLetter {
    DeadLetter {
        reason,
        error: cause.to_string(),
        partition_key: delivery.partition_key.clone(),
        payload: delivery.payload.clone(),
        sequence: delivery.sequence,
    }
}

async fn extend_deadline(delivery: &Delivery) {
    if let Err(e) = delivery.progress().await {
        debug!(sequence = ?delivery.sequence, error = %e, "Failed to extend ack deadline");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, LockStatus, MemoryAccountStore};
    use crate::channel::{
        Acknowledge, DeliveryStream, EventPublisher, MemoryDeadLetters, MemoryEventLog,
    };
    use crate::error::DatabaseError;
    use std::sync::Mutex;
    use std::time::Duration;

    struct CountingAck(Arc<AtomicU64>);

    #[async_trait::async_trait]
    impl Acknowledge for CountingAck {
        async fn ack(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands out a fixed sequence of deliveries once, then idles
    struct ScriptedSource(Mutex<Option<Vec<Delivery>>>);

    #[async_trait::async_trait]
    impl EventSource for ScriptedSource {
        async fn subscribe(&self) -> Result<DeliveryStream> {
            let script = self.0.lock().unwrap().take().unwrap_or_default();
            Ok(futures::stream::iter(script.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed())
        }
    }

    async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    struct Harness {
        reconciler: Arc<Reconciler>,
        store: Arc<MemoryAccountStore>,
        dead: Arc<MemoryDeadLetters>,
        log: MemoryEventLog,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryAccountStore::new());
        store.insert(Account::active("alice", "pw"));
        store.insert(Account::active("bob", "pw"));
        let dead = Arc::new(MemoryDeadLetters::new());
        let config = ReconcilerConfig::default().with_retry(3, 1, 5);
        let reconciler = Arc::new(Reconciler::new(config, store.clone(), dead.clone()));
        Harness {
            reconciler,
            store,
            dead,
            log: MemoryEventLog::new(),
        }
    }

    async fn next_delivery(log: &MemoryEventLog) -> Delivery {
        let mut stream = log.subscribe().await.unwrap();
        stream.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_applies_and_acks() {
        let h = harness();
        h.log
            .publish(&LockoutEvent::new("alice", 5).unwrap())
            .await
            .unwrap();

        let outcome = h.reconciler.process(next_delivery(&h.log).await).await;
        assert_eq!(outcome, ReconcileOutcome::Applied);
        assert_eq!(h.log.unacked(), 0);

        let account = h.store.find_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(account.lock_status, LockStatus::Locked);
        assert_eq!(account.failed_count, 5);

        let audit = h.store.audit_records("alice").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].stream_sequence, Some(1));
        assert!(audit[0].raw_payload.contains("\"failed_count\":5"));
    }

    #[tokio::test]
    async fn test_legacy_payload_is_applied() {
        let h = harness();
        h.log
            .append_raw(Some("alice"), br#"{"user":"alice","failedCount":5}"#.to_vec());

        let outcome = h.reconciler.process(next_delivery(&h.log).await).await;
        assert_eq!(outcome, ReconcileOutcome::Applied);

        let account = h.store.find_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(account.lock_status, LockStatus::Locked);
        assert_eq!(account.failed_count, 5);
        assert!(h.dead.letters().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_event_is_dead_lettered_and_acked() {
        let h = harness();
        h.log.append_raw(Some("alice"), br#"{"identity":"alice"}"#.to_vec());

        let outcome = h.reconciler.process(next_delivery(&h.log).await).await;
        assert_eq!(outcome, ReconcileOutcome::DeadLettered(DeadLetterReason::Malformed));
        assert_eq!(h.log.unacked(), 0);

        let letters = h.dead.letters();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].error.contains("failed_count"));
        assert!(h.store.audit_records("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let h = harness();
        h.store.fail_next_applies([
            DatabaseError::connection_failed("reset"),
            DatabaseError::pool_exhausted("busy"),
        ]);
        h.log
            .publish(&LockoutEvent::new("alice", 5).unwrap())
            .await
            .unwrap();

        let outcome = h.reconciler.process(next_delivery(&h.log).await).await;
        assert_eq!(outcome, ReconcileOutcome::Applied);
        assert_eq!(h.store.audit_records("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_to_dead_letter() {
        let h = harness();
        h.store
            .fail_next_applies((0..3).map(|_| DatabaseError::connection_failed("down")));
        h.log
            .publish(&LockoutEvent::new("alice", 5).unwrap())
            .await
            .unwrap();

        let outcome = h.reconciler.process(next_delivery(&h.log).await).await;
        assert_eq!(
            outcome,
            ReconcileOutcome::DeadLettered(DeadLetterReason::TransientExhausted)
        );
        assert_eq!(h.log.unacked(), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let h = harness();
        h.store.fail_next_applies([
            DatabaseError::query_failed("permission denied"),
            DatabaseError::connection_failed("never reached"),
        ]);
        h.log
            .publish(&LockoutEvent::new("alice", 5).unwrap())
            .await
            .unwrap();

        let outcome = h.reconciler.process(next_delivery(&h.log).await).await;
        assert_eq!(outcome, ReconcileOutcome::DeadLettered(DeadLetterReason::Permanent));
    }

    #[tokio::test]
    async fn test_unavailable_dead_letter_sink_defers() {
        let h = harness();
        h.dead.set_unavailable(true);
        h.log.append_raw(Some("alice"), b"garbage".to_vec());

        let outcome = h.reconciler.process(next_delivery(&h.log).await).await;
        assert_eq!(outcome, ReconcileOutcome::Deferred);
        assert_eq!(h.log.unacked(), 1);
        assert_eq!(h.reconciler.stats().deferred, 1);
    }

    #[test]
    fn test_lane_is_stable_per_identity() {
        let h = harness();
        let lane = h.reconciler.lane_for(Some("alice"));
        for _ in 0..10 {
            assert_eq!(h.reconciler.lane_for(Some("alice")), lane);
        }
        assert!(lane < 4);
        assert_eq!(h.reconciler.lane_for(None), 0);
    }

    #[tokio::test]
    async fn test_run_keeps_per_identity_order_and_stops_on_shutdown() {
        let h = harness();
        for count in 5..10 {
            h.log
                .publish(&LockoutEvent::new("alice", count).unwrap())
                .await
                .unwrap();
            h.log
                .publish(&LockoutEvent::new("bob", count + 10).unwrap())
                .await
                .unwrap();
        }
        h.log.append_raw(Some("bob"), b"{}".to_vec());

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&h.reconciler).run(
            Arc::new(h.log.clone()),
            shutdown.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.log.unacked() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        runner.await.unwrap().unwrap();

        let alice: Vec<u32> = h
            .store
            .audit_records("alice")
            .await
            .unwrap()
            .iter()
            .map(|r| r.failed_count)
            .collect();
        assert_eq!(alice, vec![5, 6, 7, 8, 9]);
        assert_eq!(
            h.store.find_by_identity("bob").await.unwrap().unwrap().failed_count,
            19
        );
        assert_eq!(h.reconciler.stats().applied, 10);
        assert_eq!(h.reconciler.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_stuck_event_holds_later_events_for_same_identity() {
        let h = harness();
        h.store
            .fail_next_applies((0..3).map(|_| DatabaseError::connection_failed("down")));
        h.dead.set_unavailable(true);
        for count in [5, 6] {
            h.log
                .publish(&LockoutEvent::new("alice", count).unwrap())
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&h.reconciler).run(
            Arc::new(h.log.clone()),
            shutdown.clone(),
        ));

        wait_for("first event held", || h.reconciler.stats().deferred == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.reconciler.stats().applied, 0);
        assert!(h.store.audit_records("alice").await.unwrap().is_empty());
        assert_eq!(h.log.unacked(), 2);

        h.dead.set_unavailable(false);
        wait_for("both events settled", || h.log.unacked() == 0).await;
        shutdown.cancel();
        runner.await.unwrap().unwrap();

        let letters = h.dead.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::TransientExhausted);
        assert_eq!(letters[0].sequence, Some(1));

        let account = h.store.find_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(account.failed_count, 6);
        let audit: Vec<u32> = h
            .store
            .audit_records("alice")
            .await
            .unwrap()
            .iter()
            .map(|r| r.failed_count)
            .collect();
        assert_eq!(audit, vec![6]);

        let stats = h.reconciler.stats();
        assert_eq!((stats.applied, stats.dead_lettered, stats.deferred), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_held_ack_blocks_lane_until_it_goes_through() {
        let h = harness();
        h.log.set_lose_acks(true);
        for count in [5, 6] {
            h.log
                .publish(&LockoutEvent::new("alice", count).unwrap())
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(Arc::clone(&h.reconciler).run(
            Arc::new(h.log.clone()),
            shutdown.clone(),
        ));

        wait_for("ack held", || h.reconciler.stats().deferred == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.store.audit_records("alice").await.unwrap().len(), 1);

        h.log.set_lose_acks(false);
        wait_for("both events acked", || h.log.unacked() == 0).await;
        shutdown.cancel();
        runner.await.unwrap().unwrap();

        let audit: Vec<u32> = h
            .store
            .audit_records("alice")
            .await
            .unwrap()
            .iter()
            .map(|r| r.failed_count)
            .collect();
        assert_eq!(audit, vec![5, 6]);
        assert_eq!(h.reconciler.stats().applied, 2);
    }

    #[tokio::test]
    async fn test_redelivered_copy_behind_settled_position_is_skipped() {
        let h = harness();
        let acks = Arc::new(AtomicU64::new(0));
        let older = LockoutEvent::new("alice", 5).unwrap();
        let newer = LockoutEvent::new("alice", 6).unwrap();
        let delivery = |event: &LockoutEvent, sequence| {
            Delivery::new(
                Some("alice".to_string()),
                event.payload.clone(),
                Some(sequence),
                Box::new(CountingAck(acks.clone())),
            )
        };
        let source = ScriptedSource(Mutex::new(Some(vec![
            delivery(&older, 1),
            delivery(&newer, 2),
            delivery(&older, 1),
        ])));

        let shutdown = CancellationToken::new();
        let runner = tokio::spawn(
            Arc::clone(&h.reconciler).run(Arc::new(source), shutdown.clone()),
        );
        wait_for("three acks", || acks.load(Ordering::SeqCst) == 3).await;
        shutdown.cancel();
        runner.await.unwrap().unwrap();

        let account = h.store.find_by_identity("alice").await.unwrap().unwrap();
        assert_eq!(account.failed_count, 6);
        assert_eq!(h.store.audit_records("alice").await.unwrap().len(), 2);
        let stats = h.reconciler.stats();
        assert_eq!((stats.applied, stats.stale), (2, 1));
    }
}
