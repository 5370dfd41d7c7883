use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

use super::*;

type Order = Vec<String>;

fn ids(items: &[&str]) -> Order {
    items.iter().map(|s| (*s).to_owned()).collect()
}

#[derive(Default)]
struct MockSink {
    calls: Mutex<Vec<Vec<OptimisticChange<Order>>>>,
    fail_with: Mutex<Option<MutationError>>,
    gate: Option<Arc<Notify>>,
    persisted: AtomicUsize,
}

impl MockSink {
    fn failing(err: MutationError) -> Self {
        Self { fail_with: Mutex::new(Some(err)), ..Self::default() }
    }

    fn gated(gate: Arc<Notify>) -> Self {
        Self { gate: Some(gate), ..Self::default() }
    }

    fn calls(&self) -> Vec<Vec<OptimisticChange<Order>>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MutationSink<Order> for MockSink {
    async fn persist(&self, _resource_id: &str, changes: &[OptimisticChange<Order>]) -> Result<(), MutationError> {
        self.calls.lock().unwrap().push(changes.to_vec());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.persisted.fetch_add(1, Ordering::SeqCst);
        match self.fail_with.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn baseline() -> Vec<(String, Order)> {
    vec![
        ("day-1".to_owned(), ids(&["museum", "lunch", "park"])),
        ("day-2".to_owned(), ids(&["hike", "dinner"])),
    ]
}

fn coordinator(sink: Arc<MockSink>) -> MutationCoordinator<Order> {
    MutationCoordinator::new("trip-42", baseline(), sink, Duration::from_secs(30))
}

async fn wait_until_saving(coordinator: &MutationCoordinator<Order>) {
    while !coordinator.is_saving() {
        tokio::task::yield_now().await;
    }
}

fn record(coordinator: &MutationCoordinator<Order>) -> Arc<Mutex<Vec<MutationEvent<Order>>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    coordinator
        .events()
        .on(CHANNEL_MUTATION, move |event: &MutationEvent<Order>| sink.lock().unwrap().push(event.clone()));
    seen
}

// =============================================================================
// LOCAL EDITS
// =============================================================================

#[test]
fn apply_locally_is_visible_immediately() {
    let coordinator = coordinator(Arc::new(MockSink::default()));

    let change = coordinator
        .apply_locally("day-1", ids(&["lunch", "museum", "park"]))
        .unwrap();

    assert_eq!(change.status, ChangeStatus::Pending);
    assert_eq!(change.previous_state, Some(ids(&["museum", "lunch", "park"])));
    assert_eq!(coordinator.get("day-1"), Some(ids(&["lunch", "museum", "park"])));
    assert_eq!(coordinator.baseline()["day-1"], ids(&["museum", "lunch", "park"]));
    assert!(coordinator.has_pending());
}

#[test]
fn discard_changes_restores_previous_state_exactly() {
    let coordinator = coordinator(Arc::new(MockSink::default()));
    let before = coordinator.view();

    coordinator.apply_locally("day-1", ids(&["park", "lunch", "museum"]));
    coordinator.apply_locally("day-2", ids(&["dinner", "hike"]));
    let discarded = coordinator.discard_changes().unwrap();

    assert_eq!(discarded.len(), 2);
    assert!(discarded.iter().all(|c| c.status == ChangeStatus::RolledBack));
    assert_eq!(coordinator.view(), before);
    assert!(coordinator.pending().is_empty());
}

#[test]
fn discard_reverts_one_entity() {
    let coordinator = coordinator(Arc::new(MockSink::default()));
    coordinator.apply_locally("day-1", ids(&["park", "lunch", "museum"]));
    coordinator.apply_locally("day-2", ids(&["dinner", "hike"]));

    let reverted = coordinator.discard("day-2").unwrap();

    assert_eq!(reverted.previous_state, Some(ids(&["hike", "dinner"])));
    assert_eq!(coordinator.get("day-2"), Some(ids(&["hike", "dinner"])));
    assert_eq!(coordinator.get("day-1"), Some(ids(&["park", "lunch", "museum"])));
    assert_eq!(coordinator.discard("day-2"), Err(MutationError::NothingPending("day-2".into())));
}

#[test]
fn repeated_gestures_fold_into_one_change() {
    let coordinator = coordinator(Arc::new(MockSink::default()));
    coordinator.apply_locally("day-1", ids(&["lunch", "museum", "park"]));
    coordinator.apply_locally("day-1", ids(&["lunch", "park", "museum"]));

    let pending = coordinator.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].previous_state, Some(ids(&["museum", "lunch", "park"])));
    assert_eq!(pending[0].proposed_state, ids(&["lunch", "park", "museum"]));
}

#[test]
fn gesture_back_to_baseline_leaves_nothing_pending() {
    let coordinator = coordinator(Arc::new(MockSink::default()));
    assert!(coordinator.apply_locally("day-1", ids(&["museum", "lunch", "park"])).is_none());

    coordinator.apply_locally("day-1", ids(&["lunch", "museum", "park"]));
    assert!(coordinator.apply_locally("day-1", ids(&["museum", "lunch", "park"])).is_none());
    assert!(!coordinator.has_pending());
}

#[test]
fn new_entity_has_no_previous_state() {
    let coordinator = coordinator(Arc::new(MockSink::default()));
    let change = coordinator.apply_locally("day-3", ids(&["beach"])).unwrap();
    assert_eq!(change.previous_state, None);

    coordinator.discard("day-3").unwrap();
    assert_eq!(coordinator.get("day-3"), None);
}

// =============================================================================
// SAVE
// =============================================================================

#[tokio::test]
async fn save_commits_every_pending_change_in_one_batch() {
    let sink = Arc::new(MockSink::default());
    let coordinator = coordinator(Arc::clone(&sink));
    let events = record(&coordinator);

    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));
    coordinator.apply_locally("day-2", ids(&["dinner", "hike"]));
    let committed = coordinator.save().await.unwrap();

    assert_eq!(committed.len(), 2);
    assert!(committed.iter().all(|c| c.status == ChangeStatus::Committed));
    assert_eq!(coordinator.get("day-1"), Some(ids(&["park", "museum", "lunch"])));
    assert_eq!(coordinator.get("day-2"), Some(ids(&["dinner", "hike"])));
    assert_eq!(coordinator.baseline(), coordinator.view());
    assert!(!coordinator.has_pending());

    let calls = sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 2);

    let committed_events = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, MutationEvent::Committed(_)))
        .count();
    assert_eq!(committed_events, 2);
}

#[tokio::test]
async fn failed_save_rolls_back_whole_batch_with_one_error() {
    let sink = Arc::new(MockSink::failing(MutationError::Unreachable("connection reset".into())));
    let coordinator = coordinator(Arc::clone(&sink));
    let before = coordinator.view();
    let events = record(&coordinator);

    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));
    coordinator.apply_locally("day-2", ids(&["dinner", "hike"]));
    let err = coordinator.save().await.unwrap_err();

    assert_eq!(err, MutationError::Unreachable("connection reset".into()));
    assert_eq!(coordinator.view(), before);
    assert!(!coordinator.has_pending());
    assert!(!coordinator.is_saving());

    let rolled_back = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, MutationEvent::RolledBack { .. }))
        .count();
    assert_eq!(rolled_back, 2);
}

#[tokio::test]
async fn save_with_nothing_pending_skips_the_sink() {
    let sink = Arc::new(MockSink::default());
    let coordinator = coordinator(Arc::clone(&sink));
    assert_eq!(coordinator.save().await, Ok(Vec::new()));
    assert!(sink.calls().is_empty());
}

#[tokio::test]
async fn confirm_persists_only_the_named_entity() {
    let sink = Arc::new(MockSink::default());
    let coordinator = coordinator(Arc::clone(&sink));
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));
    coordinator.apply_locally("day-2", ids(&["dinner", "hike"]));

    let committed = coordinator.confirm("day-2").await.unwrap();

    assert_eq!(committed.entity_id, "day-2");
    assert_eq!(committed.status, ChangeStatus::Committed);
    assert_eq!(sink.calls()[0].len(), 1);
    let still_pending = coordinator.pending();
    assert_eq!(still_pending.len(), 1);
    assert_eq!(still_pending[0].entity_id, "day-1");

    assert_eq!(coordinator.confirm("day-2").await, Err(MutationError::NothingPending("day-2".into())));
}

#[tokio::test]
async fn second_save_while_in_flight_is_refused() {
    let gate = Arc::new(Notify::new());
    let sink = Arc::new(MockSink::gated(Arc::clone(&gate)));
    let coordinator = coordinator(Arc::clone(&sink));
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.save().await })
    };
    wait_until_saving(&coordinator).await;

    assert_eq!(coordinator.save().await, Err(MutationError::SaveInFlight));
    assert_eq!(coordinator.discard("day-1"), Err(MutationError::SaveInFlight));
    assert_eq!(coordinator.discard_changes(), Err(MutationError::SaveInFlight));

    gate.notify_one();
    assert_eq!(first.await.unwrap().unwrap().len(), 1);
}

#[tokio::test]
async fn edit_during_save_stays_pending_against_new_baseline() {
    let gate = Arc::new(Notify::new());
    let sink = Arc::new(MockSink::gated(Arc::clone(&gate)));
    let coordinator = coordinator(Arc::clone(&sink));
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));

    let save = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.save().await })
    };
    wait_until_saving(&coordinator).await;
    coordinator.apply_locally("day-1", ids(&["lunch", "park", "museum"]));
    gate.notify_one();
    save.await.unwrap().unwrap();

    assert_eq!(coordinator.baseline()["day-1"], ids(&["park", "museum", "lunch"]));
    let pending = coordinator.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].previous_state, Some(ids(&["park", "museum", "lunch"])));
    assert_eq!(coordinator.get("day-1"), Some(ids(&["lunch", "park", "museum"])));
}

#[tokio::test(start_paused = true)]
async fn hung_sink_times_out_and_rolls_back() {
    let gate = Arc::new(Notify::new());
    let sink = Arc::new(MockSink::gated(gate));
    let coordinator = coordinator(Arc::clone(&sink));
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));

    let err = coordinator.save().await.unwrap_err();

    assert_eq!(err, MutationError::Timeout(Duration::from_secs(30)));
    assert!(err.retryable());
    assert_eq!(coordinator.get("day-1"), Some(ids(&["museum", "lunch", "park"])));
    assert_eq!(sink.persisted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn abandoned_save_still_commits_and_frees_the_coordinator() {
    let gate = Arc::new(Notify::new());
    let sink = Arc::new(MockSink::gated(Arc::clone(&gate)));
    let coordinator = coordinator(Arc::clone(&sink));
    let seen = record(&coordinator);
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));

    let gave_up = tokio::time::timeout(Duration::from_millis(10), coordinator.save()).await;
    assert!(gave_up.is_err());
    assert!(coordinator.is_saving());
    assert_eq!(coordinator.discard_changes(), Err(MutationError::SaveInFlight));

    gate.notify_one();
    while coordinator.is_saving() {
        tokio::task::yield_now().await;
    }

    assert!(!coordinator.has_pending());
    assert_eq!(coordinator.baseline()["day-1"], ids(&["park", "museum", "lunch"]));
    assert!(seen.lock().unwrap().iter().any(|e| matches!(e, MutationEvent::Committed(c) if c.entity_id == "day-1")));

    coordinator.apply_locally("day-2", ids(&["dinner", "hike"]));
    assert_eq!(coordinator.discard_changes().unwrap().len(), 1);
    assert_eq!(coordinator.get("day-2"), Some(ids(&["hike", "dinner"])));
}

#[tokio::test]
async fn abandoned_failing_save_rolls_back() {
    let gate = Arc::new(Notify::new());
    let sink = Arc::new(MockSink {
        gate: Some(Arc::clone(&gate)),
        ..MockSink::failing(MutationError::Rejected("day is locked".into()))
    });
    let coordinator = coordinator(Arc::clone(&sink));
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));

    assert!(tokio::time::timeout(Duration::from_millis(10), coordinator.confirm("day-1")).await.is_err());

    gate.notify_one();
    while coordinator.is_saving() {
        tokio::task::yield_now().await;
    }

    assert!(!coordinator.has_pending());
    assert_eq!(coordinator.get("day-1"), Some(ids(&["museum", "lunch", "park"])));
    assert_eq!(coordinator.save().await, Ok(Vec::new()));
}

#[tokio::test]
async fn reset_supersedes_in_flight_save() {
    let gate = Arc::new(Notify::new());
    let sink = Arc::new(MockSink::gated(Arc::clone(&gate)));
    let coordinator = coordinator(Arc::clone(&sink));
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));

    let save = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.save().await })
    };
    wait_until_saving(&coordinator).await;
    coordinator.reset("trip-7", vec![("day-1".to_owned(), ids(&["beach"]))]);
    gate.notify_one();

    assert_eq!(save.await.unwrap(), Err(MutationError::Superseded));
    assert_eq!(coordinator.resource_id(), "trip-7");
    assert_eq!(coordinator.get("day-1"), Some(ids(&["beach"])));
    assert!(!coordinator.has_pending());
    assert!(!coordinator.is_saving());
}

// =============================================================================
// SERVER PUSHES
// =============================================================================

#[test]
fn push_for_untouched_entity_applies_at_once() {
    let coordinator = coordinator(Arc::new(MockSink::default()));
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));

    assert_eq!(coordinator.apply_remote("day-2", ids(&["dinner"])), RemoteOutcome::Applied);
    assert_eq!(coordinator.get("day-2"), Some(ids(&["dinner"])));
    assert_eq!(coordinator.get("day-1"), Some(ids(&["park", "museum", "lunch"])));
}

#[test]
fn push_for_pending_entity_is_deferred_then_replayed_on_discard() {
    let coordinator = coordinator(Arc::new(MockSink::default()));
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));

    assert_eq!(coordinator.apply_remote("day-1", ids(&["museum", "park"])), RemoteOutcome::Deferred);
    assert_eq!(coordinator.get("day-1"), Some(ids(&["park", "museum", "lunch"])));

    coordinator.discard("day-1").unwrap();
    assert_eq!(coordinator.get("day-1"), Some(ids(&["museum", "park"])));
}

#[tokio::test]
async fn push_deferred_before_save_is_superseded_by_commit() {
    let coordinator = coordinator(Arc::new(MockSink::default()));
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));
    coordinator.apply_remote("day-1", ids(&["museum", "park"]));

    coordinator.save().await.unwrap();

    assert_eq!(coordinator.get("day-1"), Some(ids(&["park", "museum", "lunch"])));
}

#[tokio::test]
async fn push_deferred_during_save_replays_after_commit() {
    let gate = Arc::new(Notify::new());
    let coordinator = coordinator(Arc::new(MockSink::gated(Arc::clone(&gate))));
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));

    let save = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.save().await })
    };
    wait_until_saving(&coordinator).await;
    assert_eq!(coordinator.apply_remote("day-1", ids(&["lunch"])), RemoteOutcome::Deferred);
    gate.notify_one();
    save.await.unwrap().unwrap();

    assert_eq!(coordinator.get("day-1"), Some(ids(&["lunch"])));
}

#[tokio::test]
async fn push_deferred_then_failed_save_replays_push() {
    let sink = Arc::new(MockSink::failing(MutationError::Rejected("conflict".into())));
    let coordinator = coordinator(sink);
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));
    coordinator.apply_remote("day-1", ids(&["museum", "park"]));

    assert!(coordinator.save().await.is_err());
    assert_eq!(coordinator.get("day-1"), Some(ids(&["museum", "park"])));
}

#[test]
fn snapshot_merges_by_entity_id() {
    let coordinator = coordinator(Arc::new(MockSink::default()));
    coordinator.apply_locally("day-1", ids(&["park", "museum", "lunch"]));

    let outcomes = coordinator.apply_remote_snapshot(vec![
        ("day-1".to_owned(), ids(&["lunch"])),
        ("day-2".to_owned(), ids(&["hike"])),
    ]);

    assert_eq!(
        outcomes,
        vec![("day-1".to_owned(), RemoteOutcome::Deferred), ("day-2".to_owned(), RemoteOutcome::Applied)]
    );
    let view = coordinator.view();
    assert_eq!(view["day-1"], ids(&["park", "museum", "lunch"]));
    assert_eq!(view["day-2"], ids(&["hike"]));
}

// =============================================================================
// HELPERS
// =============================================================================

#[test]
fn move_item_reorders_and_checks_bounds() {
    let items = ids(&["a", "b", "c"]);
    assert_eq!(move_item(&items, 0, 2), Some(ids(&["b", "c", "a"])));
    assert_eq!(move_item(&items, 2, 0), Some(ids(&["c", "a", "b"])));
    assert_eq!(move_item(&items, 1, 1), Some(items.clone()));
    assert_eq!(move_item(&items, 3, 0), None);
}

#[test]
fn error_codes() {
    assert_eq!(MutationError::SaveInFlight.error_code(), "E_SAVE_IN_FLIGHT");
    assert_eq!(MutationError::Rejected("x".into()).error_code(), "E_MUTATION_REJECTED");
    assert!(!MutationError::Rejected("x".into()).retryable());
}
