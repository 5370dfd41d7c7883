//! Optimistic mutation coordinator — local-first edits reconciled with the
//! server.
//!
//! DESIGN
//! ======
//! Gestures land in the view model immediately as `Pending` changes keyed by
//! entity id. `save` snapshots the pending batch under the lock, persists it
//! through the [`MutationSink`] with the lock released, then acknowledges
//! only the entries whose revision is unchanged since the snapshot. An
//! entity edited again mid-save stays pending against the newly committed
//! baseline.
//!
//! The persist and its reconciliation run on a spawned task. Dropping the
//! `save` future stops the wait, not the write: the batch still commits or
//! rolls back and the usual events fire.
//!
//! SERVER PUSHES
//! =============
//! Pushes merge by entity id. An entity with no pending change takes the
//! pushed state at once. An entity with a pending change defers the push
//! until the change resolves:
//! - rolled back or discarded: every deferred push replays
//! - committed: pushes received after the save was issued replay; older
//!   ones are superseded by the committed write
//!
//! STALENESS
//! =========
//! `reset` bumps an epoch. A save that resolves under an older epoch
//! leaves the new view model untouched and reports `Superseded`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::events::EventEmitter;
use crate::net::types::ErrorCode;

/// Channel carrying every [`MutationEvent`].
pub const CHANNEL_MUTATION: &str = "mutation";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error("server rejected the change: {0}")]
    Rejected(String),
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("save timed out after {0:?}")]
    Timeout(Duration),
    #[error("a save is already in flight")]
    SaveInFlight,
    #[error("save result arrived after the view was reset")]
    Superseded,
    #[error("no pending change for {0}")]
    NothingPending(String),
}

impl ErrorCode for MutationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "E_MUTATION_REJECTED",
            Self::Unreachable(_) => "E_MUTATION_UNREACHABLE",
            Self::Timeout(_) => "E_MUTATION_TIMEOUT",
            Self::SaveInFlight => "E_SAVE_IN_FLIGHT",
            Self::Superseded => "E_SUPERSEDED",
            Self::NothingPending(_) => "E_NOTHING_PENDING",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Pending,
    Committed,
    RolledBack,
}

/// One entity's local edit and its reconciliation status.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticChange<S> {
    pub entity_id: String,
    /// Baseline before the edit. `None` when the entity had no baseline.
    pub previous_state: Option<S>,
    pub proposed_state: S,
    pub status: ChangeStatus,
}

impl<S> OptimisticChange<S> {
    fn with_status(mut self, status: ChangeStatus) -> Self {
        self.status = status;
        self
    }
}

/// What happened to a server push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    Applied,
    /// Held until the entity's pending change resolves.
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationEvent<S> {
    Applied(OptimisticChange<S>),
    Committed(OptimisticChange<S>),
    RolledBack { change: OptimisticChange<S>, reason: String },
    RemoteApplied { entity_id: String, state: S },
    RemoteDeferred { entity_id: String },
    Reset { resource_id: String },
}

/// Durable write path for a batch of changes.
#[async_trait]
pub trait MutationSink<S>: Send + Sync {
    /// Persist `changes` for `resource_id` as one unit.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError::Rejected`] or [`MutationError::Unreachable`];
    /// either rolls back the whole batch.
    async fn persist(&self, resource_id: &str, changes: &[OptimisticChange<S>]) -> Result<(), MutationError>;
}

// =============================================================================
// STATE
// =============================================================================

struct PendingEntry<S> {
    change: OptimisticChange<S>,
    /// Bumped on every gesture against this entity.
    revision: u64,
}

struct DeferredPush<S> {
    state: S,
    seq: u64,
}

#[derive(Clone, Copy)]
struct SaveTicket {
    epoch: u64,
    issued_at_seq: u64,
}

struct CoordinatorState<S> {
    resource_id: String,
    baseline: BTreeMap<String, S>,
    pending: Vec<PendingEntry<S>>,
    deferred: HashMap<String, DeferredPush<S>>,
    saving: Option<SaveTicket>,
    epoch: u64,
    remote_seq: u64,
    next_revision: u64,
}

impl<S: Clone + PartialEq> CoordinatorState<S> {
    fn pending_index(&self, entity_id: &str) -> Option<usize> {
        self.pending.iter().position(|e| e.change.entity_id == entity_id)
    }

    fn bump_revision(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    /// Once `entity_id` has nothing pending, replay its deferred push if it
    /// arrived after `after_seq`.
    fn settle(&mut self, entity_id: &str, after_seq: u64, events: &mut Vec<MutationEvent<S>>) {
        if self.pending_index(entity_id).is_some() {
            return;
        }
        let Some(push) = self.deferred.remove(entity_id) else {
            return;
        };
        if push.seq <= after_seq {
            debug!(resource_id = %self.resource_id, entity_id, "mutation: deferred push superseded by commit");
            return;
        }
        self.baseline.insert(entity_id.to_owned(), push.state.clone());
        events.push(MutationEvent::RemoteApplied { entity_id: entity_id.to_owned(), state: push.state });
    }

    fn apply_remote(&mut self, entity_id: &str, remote: S, events: &mut Vec<MutationEvent<S>>) -> RemoteOutcome {
        self.remote_seq += 1;
        let seq = self.remote_seq;
        if self.pending_index(entity_id).is_some() {
            debug!(resource_id = %self.resource_id, entity_id, "mutation: deferring push for pending entity");
            self.deferred.insert(entity_id.to_owned(), DeferredPush { state: remote, seq });
            events.push(MutationEvent::RemoteDeferred { entity_id: entity_id.to_owned() });
            return RemoteOutcome::Deferred;
        }
        self.baseline.insert(entity_id.to_owned(), remote.clone());
        events.push(MutationEvent::RemoteApplied { entity_id: entity_id.to_owned(), state: remote });
        RemoteOutcome::Applied
    }

    fn roll_back(&mut self, idx: usize, reason: &str, events: &mut Vec<MutationEvent<S>>) -> OptimisticChange<S> {
        let entry = self.pending.remove(idx);
        let change = entry.change.with_status(ChangeStatus::RolledBack);
        events.push(MutationEvent::RolledBack { change: change.clone(), reason: reason.to_owned() });
        self.settle(&change.entity_id, 0, events);
        change
    }
}

// =============================================================================
// COORDINATOR
// =============================================================================

/// Local-first view model for one resource, generic over entity state `S`.
pub struct MutationCoordinator<S> {
    state: Arc<Mutex<CoordinatorState<S>>>,
    sink: Arc<dyn MutationSink<S>>,
    events: EventEmitter<MutationEvent<S>>,
    request_timeout: Duration,
}

impl<S> Clone for MutationCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            sink: Arc::clone(&self.sink),
            events: self.events.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

impl<S> MutationCoordinator<S>
where
    S: Clone + PartialEq + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(
        resource_id: impl Into<String>,
        baseline: impl IntoIterator<Item = (String, S)>,
        sink: Arc<dyn MutationSink<S>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState {
                resource_id: resource_id.into(),
                baseline: baseline.into_iter().collect(),
                pending: Vec::new(),
                deferred: HashMap::new(),
                saving: None,
                epoch: 0,
                remote_seq: 0,
                next_revision: 0,
            })),
            sink,
            events: EventEmitter::new(),
            request_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_all(&self, events: Vec<MutationEvent<S>>) {
        for event in &events {
            self.events.emit(CHANNEL_MUTATION, event);
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventEmitter<MutationEvent<S>> {
        &self.events
    }

    #[must_use]
    pub fn resource_id(&self) -> String {
        self.lock().resource_id.clone()
    }

    // -------------------------------------------------------------------------
    // LOCAL EDITS
    // -------------------------------------------------------------------------

    /// Show `proposed` for `entity_id` immediately as a pending change.
    ///
    /// Repeated gestures fold into one change. Returns `None` when the
    /// gesture lands back on the baseline, leaving nothing pending.
    pub fn apply_locally(&self, entity_id: &str, proposed: S) -> Option<OptimisticChange<S>> {
        let mut events = Vec::new();
        let change = {
            let mut state = self.lock();
            let revision = state.bump_revision();
            let saving = state.saving.is_some();

            match state.pending_index(entity_id) {
                Some(idx) if !saving && state.pending[idx].change.previous_state.as_ref() == Some(&proposed) => {
                    let entry = state.pending.remove(idx);
                    let reverted = entry.change.with_status(ChangeStatus::RolledBack);
                    events.push(MutationEvent::RolledBack { change: reverted, reason: "reverted locally".into() });
                    state.settle(entity_id, 0, &mut events);
                    None
                }
                Some(idx) => {
                    let entry = &mut state.pending[idx];
                    entry.change.proposed_state = proposed;
                    entry.revision = revision;
                    Some(entry.change.clone())
                }
                None if state.baseline.get(entity_id) == Some(&proposed) => None,
                None => {
                    let change = OptimisticChange {
                        entity_id: entity_id.to_owned(),
                        previous_state: state.baseline.get(entity_id).cloned(),
                        proposed_state: proposed,
                        status: ChangeStatus::Pending,
                    };
                    state.pending.push(PendingEntry { change: change.clone(), revision });
                    Some(change)
                }
            }
        };

        if let Some(change) = &change {
            debug!(entity_id, "mutation: applied locally");
            events.push(MutationEvent::Applied(change.clone()));
        }
        self.emit_all(events);
        change
    }

    /// Persist every pending change as one batch.
    ///
    /// Returns the committed changes; an empty batch commits nothing.
    ///
    /// # Errors
    ///
    /// On a sink failure or timeout every change in the batch rolls back
    /// and the single error is returned. Also returns
    /// [`MutationError::SaveInFlight`] and [`MutationError::Superseded`].
    pub async fn save(&self) -> Result<Vec<OptimisticChange<S>>, MutationError> {
        self.persist_batch(None).await
    }

    /// Persist only the pending change for `entity_id`.
    ///
    /// # Errors
    ///
    /// As [`Self::save`], plus [`MutationError::NothingPending`].
    pub async fn confirm(&self, entity_id: &str) -> Result<OptimisticChange<S>, MutationError> {
        let mut committed = self.persist_batch(Some(entity_id)).await?;
        committed
            .pop()
            .ok_or_else(|| MutationError::NothingPending(entity_id.to_owned()))
    }

    async fn persist_batch(&self, only: Option<&str>) -> Result<Vec<OptimisticChange<S>>, MutationError> {
        // PHASE: SNAPSHOT BATCH
        let (resource_id, batch, ticket) = {
            let mut state = self.lock();
            if state.saving.is_some() {
                return Err(MutationError::SaveInFlight);
            }
            let batch: Vec<(OptimisticChange<S>, u64)> = state
                .pending
                .iter()
                .filter(|e| only.is_none_or(|id| e.change.entity_id == id))
                .map(|e| (e.change.clone(), e.revision))
                .collect();
            if batch.is_empty() {
                return match only {
                    Some(id) => Err(MutationError::NothingPending(id.to_owned())),
                    None => Ok(Vec::new()),
                };
            }
            let ticket = SaveTicket { epoch: state.epoch, issued_at_seq: state.remote_seq };
            state.saving = Some(ticket);
            (state.resource_id.clone(), batch, ticket)
        };

        // PHASE: PERSIST WITHOUT THE LOCK, RECONCILE ON COMPLETION
        // The task owns the write from here; a caller that stops waiting
        // does not leave `saving` set.
        let fallback = batch.clone();
        let coordinator = self.clone();
        let task = tokio::spawn(async move {
            let result = coordinator.persist_bounded(&resource_id, &batch).await;
            coordinator.resolve(batch, ticket, result)
        });
        match task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                let failure = MutationError::Unreachable(format!("save task failed: {err}"));
                self.resolve(fallback, ticket, Err(failure))
            }
        }
    }

    async fn persist_bounded(
        &self,
        resource_id: &str,
        batch: &[(OptimisticChange<S>, u64)],
    ) -> Result<(), MutationError> {
        let changes: Vec<OptimisticChange<S>> = batch.iter().map(|(c, _)| c.clone()).collect();
        info!(%resource_id, count = changes.len(), "mutation: saving batch");
        match tokio::time::timeout(self.request_timeout, self.sink.persist(resource_id, &changes)).await {
            Ok(result) => result,
            Err(elapsed) => {
                debug!(%resource_id, %elapsed, "mutation: sink did not answer");
                Err(MutationError::Timeout(self.request_timeout))
            }
        }
    }

    fn resolve(
        &self,
        batch: Vec<(OptimisticChange<S>, u64)>,
        ticket: SaveTicket,
        result: Result<(), MutationError>,
    ) -> Result<Vec<OptimisticChange<S>>, MutationError> {
        let mut events = Vec::new();
        let outcome = {
            let mut state = self.lock();
            if state.epoch != ticket.epoch {
                warn!(resource_id = %state.resource_id, "mutation: save resolved after reset; ignoring");
                return Err(MutationError::Superseded);
            }
            state.saving = None;

            match result {
                Ok(()) => {
                    let mut committed = Vec::with_capacity(batch.len());
                    for (change, revision) in batch {
                        let entity_id = change.entity_id.clone();
                        state.baseline.insert(entity_id.clone(), change.proposed_state.clone());
                        if let Some(idx) = state.pending_index(&entity_id) {
                            if state.pending[idx].revision == revision {
                                state.pending.remove(idx);
                            } else {
                                // Edited again mid-save: keep pending against the new baseline.
                                state.pending[idx].change.previous_state = Some(change.proposed_state.clone());
                            }
                        }
                        let change = change.with_status(ChangeStatus::Committed);
                        events.push(MutationEvent::Committed(change.clone()));
                        state.settle(&entity_id, ticket.issued_at_seq, &mut events);
                        committed.push(change);
                    }
                    info!(resource_id = %state.resource_id, count = committed.len(), "mutation: batch committed");
                    Ok(committed)
                }
                Err(err) => {
                    let reason = err.to_string();
                    for (change, _) in &batch {
                        if let Some(idx) = state.pending_index(&change.entity_id) {
                            state.roll_back(idx, &reason, &mut events);
                        }
                    }
                    warn!(resource_id = %state.resource_id, count = batch.len(), error = %err, "mutation: batch rolled back");
                    Err(err)
                }
            }
        };
        self.emit_all(events);
        outcome
    }

    /// Revert one entity to its previous state without a server round trip.
    ///
    /// # Errors
    ///
    /// [`MutationError::NothingPending`] when the entity has no pending
    /// change, [`MutationError::SaveInFlight`] while a save is outstanding.
    pub fn discard(&self, entity_id: &str) -> Result<OptimisticChange<S>, MutationError> {
        let mut events = Vec::new();
        let change = {
            let mut state = self.lock();
            if state.saving.is_some() {
                return Err(MutationError::SaveInFlight);
            }
            let idx = state
                .pending_index(entity_id)
                .ok_or_else(|| MutationError::NothingPending(entity_id.to_owned()))?;
            state.roll_back(idx, "discarded", &mut events)
        };
        self.emit_all(events);
        Ok(change)
    }

    /// Revert every pending change. Returns what was discarded.
    ///
    /// # Errors
    ///
    /// [`MutationError::SaveInFlight`] while a save is outstanding.
    pub fn discard_changes(&self) -> Result<Vec<OptimisticChange<S>>, MutationError> {
        let mut events = Vec::new();
        let discarded = {
            let mut state = self.lock();
            if state.saving.is_some() {
                return Err(MutationError::SaveInFlight);
            }
            let mut discarded = Vec::with_capacity(state.pending.len());
            while !state.pending.is_empty() {
                discarded.push(state.roll_back(0, "discarded", &mut events));
            }
            discarded
        };
        self.emit_all(events);
        Ok(discarded)
    }

    // -------------------------------------------------------------------------
    // SERVER PUSHES
    // -------------------------------------------------------------------------

    /// Merge a server-pushed state for one entity.
    pub fn apply_remote(&self, entity_id: &str, remote: S) -> RemoteOutcome {
        let mut events = Vec::new();
        let outcome = self.lock().apply_remote(entity_id, remote, &mut events);
        self.emit_all(events);
        outcome
    }

    /// Merge several pushed entities. Entities not named are left alone.
    pub fn apply_remote_snapshot(
        &self,
        snapshot: impl IntoIterator<Item = (String, S)>,
    ) -> Vec<(String, RemoteOutcome)> {
        let mut events = Vec::new();
        let outcomes = {
            let mut state = self.lock();
            snapshot
                .into_iter()
                .map(|(entity_id, remote)| {
                    let outcome = state.apply_remote(&entity_id, remote, &mut events);
                    (entity_id, outcome)
                })
                .collect()
        };
        self.emit_all(events);
        outcomes
    }

    /// Replace the whole view model, e.g. when the view switches resource.
    /// Outstanding saves resolve as [`MutationError::Superseded`].
    pub fn reset(&self, resource_id: impl Into<String>, baseline: impl IntoIterator<Item = (String, S)>) {
        let resource_id = resource_id.into();
        {
            let mut state = self.lock();
            state.epoch += 1;
            state.resource_id.clone_from(&resource_id);
            state.baseline = baseline.into_iter().collect();
            state.pending.clear();
            state.deferred.clear();
            state.saving = None;
        }
        info!(%resource_id, "mutation: view reset");
        self.emit_all(vec![MutationEvent::Reset { resource_id }]);
    }

    // -------------------------------------------------------------------------
    // QUERIES
    // -------------------------------------------------------------------------

    /// What the UI shows: baseline overlaid with pending proposals.
    #[must_use]
    pub fn view(&self) -> BTreeMap<String, S> {
        let state = self.lock();
        let mut view = state.baseline.clone();
        for entry in &state.pending {
            view.insert(entry.change.entity_id.clone(), entry.change.proposed_state.clone());
        }
        view
    }

    #[must_use]
    pub fn get(&self, entity_id: &str) -> Option<S> {
        let state = self.lock();
        match state.pending_index(entity_id) {
            Some(idx) => Some(state.pending[idx].change.proposed_state.clone()),
            None => state.baseline.get(entity_id).cloned(),
        }
    }

    /// Last server-confirmed state.
    #[must_use]
    pub fn baseline(&self) -> BTreeMap<String, S> {
        self.lock().baseline.clone()
    }

    #[must_use]
    pub fn pending(&self) -> Vec<OptimisticChange<S>> {
        self.lock().pending.iter().map(|e| e.change.clone()).collect()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.lock().saving.is_some()
    }
}

/// Move the item at `from` to `to` within `items`.
///
/// Returns `None` when either index is out of range.
#[must_use]
pub fn move_item<T: Clone>(items: &[T], from: usize, to: usize) -> Option<Vec<T>> {
    if from >= items.len() || to >= items.len() {
        return None;
    }
    let mut moved = items.to_vec();
    let item = moved.remove(from);
    moved.insert(to, item);
    Some(moved)
}

#[cfg(test)]
#[path = "mutation_test.rs"]
mod tests;
