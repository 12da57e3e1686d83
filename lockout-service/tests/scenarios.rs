//! End-to-end lockout scenarios over the in-process backends
//!
//! Requests go through the coordinator, events through the emitter into the
//! in-memory log, and the reconciler applies them to the in-memory store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use lockout_service::prelude::*;
use tokio::task::JoinHandle;

const THRESHOLD: u32 = 5;

struct System {
    coordinator: Arc<LockoutCoordinator>,
    attempts: Arc<MemoryAttemptCache>,
    accounts: Arc<MemoryAccountStore>,
    log: MemoryEventLog,
    dead_letters: Arc<MemoryDeadLetters>,
}

impl System {
    fn new() -> Self {
        let attempts = Arc::new(MemoryAttemptCache::new());
        let accounts = Arc::new(MemoryAccountStore::new());
        accounts.insert(Account::active("alice", "correct-horse"));
        let log = MemoryEventLog::new();

        let (emitter, _drain) = LockoutEmitter::spawn(Arc::new(log.clone()), 64);
        let coordinator = LockoutCoordinator::new(
            LockoutConfig::default().with_max_attempts(THRESHOLD),
            attempts.clone(),
            accounts.clone(),
            Arc::new(PlaintextVerifier),
            emitter,
        );

        Self {
            coordinator: Arc::new(coordinator),
            attempts,
            accounts,
            log,
            dead_letters: Arc::new(MemoryDeadLetters::new()),
        }
    }

    fn reconciler(&self) -> Arc<Reconciler> {
        Arc::new(Reconciler::new(
            ReconcilerConfig::default().with_retry(3, 1, 5),
            self.accounts.clone(),
            self.dead_letters.clone(),
        ))
    }

    fn start(&self, reconciler: Arc<Reconciler>) -> (CancellationToken, JoinHandle<Result<()>>) {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(reconciler.run(Arc::new(self.log.clone()), shutdown.clone()));
        (shutdown, handle)
    }

    async fn fail(&self, identity: &str) -> AuthOutcome {
        self.coordinator.authenticate(identity, "wrong").await.unwrap()
    }

    /// Lock alice and wait until the event reaches the log
    async fn lock_alice(&self) {
        for _ in 0..THRESHOLD {
            self.fail("alice").await;
        }
        self.coordinator.emitter().flush().await;
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn stop(shutdown: CancellationToken, handle: JoinHandle<Result<()>>) {
    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn threshold_failure_locks_and_emits() {
    let system = System::new();

    for expected in 1..THRESHOLD as u64 {
        assert_eq!(
            system.fail("alice").await,
            AuthOutcome::Invalid { attempt_count: expected }
        );
    }
    assert_eq!(system.fail("alice").await, AuthOutcome::Locked);
    system.coordinator.emitter().flush().await;

    let events = system.log.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].identity, "alice");
    assert_eq!(events[0].failed_count, THRESHOLD);
    assert!(events[0].payload_text().contains("\"failed_count\":5"));

    let state = system.attempts.snapshot("alice").await.unwrap();
    assert_eq!(state.fail_count, Some(THRESHOLD as u64));
    assert!(state.lock_flag);
}

#[tokio::test]
async fn locked_identity_skips_credential_check() {
    let system = System::new();
    system.lock_alice().await;
    let reads = system.accounts.reads();

    let outcome = system
        .coordinator
        .authenticate("alice", "correct-horse")
        .await
        .unwrap();
    assert_eq!(outcome, AuthOutcome::Locked);
    assert_eq!(system.fail("alice").await, AuthOutcome::Locked);

    assert_eq!(system.accounts.reads(), reads);
    assert_eq!(system.log.entries().len(), 1);
}

#[tokio::test]
async fn reconciler_persists_lock_with_audit() {
    let system = System::new();
    system.lock_alice().await;

    let reconciler = system.reconciler();
    let (shutdown, handle) = system.start(reconciler.clone());
    eventually("event applied", || reconciler.stats().applied == 1).await;
    stop(shutdown, handle).await;

    let account = system.accounts.find_by_identity("alice").await.unwrap().unwrap();
    assert_eq!(account.lock_status, LockStatus::Locked);
    assert_eq!(account.failed_count, THRESHOLD);

    let audit = system.accounts.audit_records("alice").await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].failed_count, THRESHOLD);
    assert_eq!(audit[0].event_id, Some(system.log.events()[0].event_id));
    assert_eq!(system.log.unacked(), 0);
}

#[tokio::test]
async fn redelivery_after_lost_ack_is_idempotent() {
    let system = System::new();
    system.lock_alice().await;

    // First consumer commits but never acknowledges
    system.log.set_lose_acks(true);
    let first = system.reconciler();
    let (shutdown, handle) = system.start(first.clone());
    eventually("commit without ack", || first.stats().deferred == 1).await;
    stop(shutdown, handle).await;
    assert_eq!(system.log.unacked(), 1);

    system.log.set_lose_acks(false);
    let second = system.reconciler();
    let (shutdown, handle) = system.start(second.clone());
    eventually("redelivered event applied", || second.stats().applied == 1).await;
    stop(shutdown, handle).await;

    let account = system.accounts.find_by_identity("alice").await.unwrap().unwrap();
    assert_eq!(account.lock_status, LockStatus::Locked);
    assert_eq!(account.failed_count, THRESHOLD);

    let audit = system.accounts.audit_records("alice").await.unwrap();
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0].event_id, audit[1].event_id);
    assert_eq!(system.log.unacked(), 0);
}

#[tokio::test]
async fn unknown_identity_leaves_counter_untouched() {
    let system = System::new();

    assert_eq!(system.fail("mallory").await, AuthOutcome::NotFound);
    assert_eq!(system.attempts.get_counter("mallory").await.unwrap(), None);
    assert!(system.log.entries().is_empty());
}

#[tokio::test]
async fn lock_flag_holds_until_success_clears_it() {
    let system = System::new();
    system.lock_alice().await;

    for _ in 0..3 {
        assert_eq!(system.fail("alice").await, AuthOutcome::Locked);
        assert!(system.attempts.has_lock_flag("alice").await.unwrap());
    }

    // An operator reset clears the cache; the durable row is still active
    system.attempts.clear_all("alice").await.unwrap();
    let outcome = system
        .coordinator
        .authenticate("alice", "correct-horse")
        .await
        .unwrap();
    assert_eq!(outcome, AuthOutcome::Success);
    assert!(!system.attempts.has_lock_flag("alice").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_see_distinct_counts() {
    let system = System::new();
    system.accounts.insert(Account::active("user-7", "pw"));

    let config = LockoutConfig::default().with_max_attempts(1000);
    let (emitter, _drain) = LockoutEmitter::spawn(Arc::new(system.log.clone()), 64);
    let coordinator = Arc::new(LockoutCoordinator::new(
        config,
        system.attempts.clone(),
        system.accounts.clone(),
        Arc::new(PlaintextVerifier),
        emitter,
    ));

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.authenticate("user-7", "nope").await })
        })
        .collect();

    let mut counts = BTreeSet::new();
    for task in tasks {
        match task.await.unwrap().unwrap() {
            AuthOutcome::Invalid { attempt_count } => assert!(counts.insert(attempt_count)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(counts, (1..=50).collect::<BTreeSet<u64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_crossing_threshold_lock_exactly_once_below_it() {
    let system = System::new();

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let coordinator = system.coordinator.clone();
            tokio::spawn(async move { coordinator.authenticate("alice", "wrong").await })
        })
        .collect();

    let mut invalid = BTreeSet::new();
    let mut locked = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            AuthOutcome::Invalid { attempt_count } => assert!(invalid.insert(attempt_count)),
            AuthOutcome::Locked => locked += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(invalid, (1..THRESHOLD as u64).collect::<BTreeSet<u64>>());
    assert_eq!(locked, 20 - (THRESHOLD as usize - 1));
    assert!(system.attempts.has_lock_flag("alice").await.unwrap());

    system.coordinator.emitter().flush().await;
    let events = system.log.events();
    assert!(!events.is_empty());
    assert!(events.iter().all(|event| event.failed_count >= THRESHOLD));
}

#[tokio::test]
async fn replayed_event_yields_same_account_state() {
    let system = System::new();
    let event = LockoutEvent::new("alice", 7).unwrap();
    system.log.append_raw(Some("alice"), event.payload.clone());
    system.log.append_raw(Some("alice"), event.payload.clone());

    let reconciler = system.reconciler();
    let (shutdown, handle) = system.start(reconciler.clone());
    eventually("both copies applied", || reconciler.stats().applied == 2).await;
    stop(shutdown, handle).await;

    let account = system.accounts.find_by_identity("alice").await.unwrap().unwrap();
    assert_eq!(account.lock_status, LockStatus::Locked);
    assert_eq!(account.failed_count, 7);
}

#[tokio::test]
async fn success_below_threshold_resets_attempt_state() {
    let system = System::new();
    for _ in 0..THRESHOLD - 1 {
        system.fail("alice").await;
    }

    let outcome = system
        .coordinator
        .authenticate("alice", "correct-horse")
        .await
        .unwrap();
    assert_eq!(outcome, AuthOutcome::Success);

    let state = system.attempts.snapshot("alice").await.unwrap();
    assert_eq!(state.fail_count, None);
    assert!(!state.lock_flag);
    assert_eq!(system.fail("alice").await, AuthOutcome::Invalid { attempt_count: 1 });
}

#[tokio::test]
async fn malformed_event_is_dead_lettered_and_later_events_still_apply() {
    let system = System::new();
    system.log.append_raw(Some("alice"), br#"{"identity":"alice"}"#.to_vec());
    system.lock_alice().await;

    let reconciler = system.reconciler();
    let (shutdown, handle) = system.start(reconciler.clone());
    eventually("both events settled", || {
        let stats = reconciler.stats();
        stats.applied == 1 && stats.dead_lettered == 1
    })
    .await;
    stop(shutdown, handle).await;

    let letters = system.dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, DeadLetterReason::Malformed);

    let account = system.accounts.find_by_identity("alice").await.unwrap().unwrap();
    assert_eq!(account.lock_status, LockStatus::Locked);
    assert_eq!(system.log.unacked(), 0);
}

#[tokio::test]
async fn status_reports_both_sides_after_reconciliation() {
    let system = System::new();
    system.lock_alice().await;

    let reconciler = system.reconciler();
    let (shutdown, handle) = system.start(reconciler.clone());
    eventually("event applied", || reconciler.stats().applied == 1).await;
    stop(shutdown, handle).await;

    let report = system.coordinator.status("alice").await.unwrap().to_string();
    assert!(report.contains("durable.lock_status=LOCKED"));
    assert!(report.contains("durable.failed_count=5"));
    assert!(report.contains("ephemeral.fail_count=5"));
    assert!(report.contains("ephemeral.lock_flag=true"));
}
