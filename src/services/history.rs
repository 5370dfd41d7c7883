//! Revision history tracker — undo/redo availability per resource.
//!
//! DESIGN
//! ======
//! The server owns a linear revision list and a "current" marker. The
//! tracker never computes history itself: it queries the list, derives a
//! [`RevisionPointer`], and gates undo/redo on that pointer. After a
//! successful undo or redo the pointer is re-derived from a fresh query and
//! a [`HistoryEvent::Changed`] tells the view to re-fetch that resource.
//!
//! GUARDS
//! ======
//! - undo/redo are no-ops (no network call) while unavailable
//! - one history request per resource at a time; overlapping requests
//!   are skipped, not queued
//! - a failed query keeps the last known-good pointer

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::events::EventEmitter;
use crate::net::types::{ErrorCode, Revision};

/// Channel carrying every [`HistoryEvent`].
pub const CHANNEL_HISTORY: &str = "history";

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("revision history unavailable: {0}")]
    Unavailable(String),
    #[error("history request timed out after {0:?}")]
    Timeout(Duration),
}

impl ErrorCode for HistoryError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "E_HISTORY_UNAVAILABLE",
            Self::Timeout(_) => "E_HISTORY_TIMEOUT",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

/// Server-held revision list endpoints.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    /// Ordered revision list, oldest first.
    async fn list_revisions(&self, resource_id: &str) -> Result<Vec<Revision>, HistoryError>;
    async fn undo(&self, resource_id: &str) -> Result<(), HistoryError>;
    async fn redo(&self, resource_id: &str) -> Result<(), HistoryError>;
}

/// Position of the current revision within the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionPointer {
    pub current_version: i64,
    pub can_undo: bool,
    pub can_redo: bool,
}

impl Default for RevisionPointer {
    fn default() -> Self {
        Self { current_version: 1, can_undo: false, can_redo: false }
    }
}

impl RevisionPointer {
    /// Derive the pointer from an ordered revision list.
    ///
    /// The flagged entry is current; with no flag, the last entry is.
    #[must_use]
    pub fn from_revisions(revisions: &[Revision]) -> Self {
        let Some(last) = revisions.len().checked_sub(1) else {
            return Self::default();
        };
        let idx = revisions.iter().position(|r| r.is_current).unwrap_or(last);
        Self { current_version: revisions[idx].version, can_undo: idx > 0, can_redo: idx < last }
    }

    #[must_use]
    pub fn allows(self, command: HistoryCommand) -> bool {
        match command {
            HistoryCommand::Undo => self.can_undo,
            HistoryCommand::Redo => self.can_redo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryCommand {
    Undo,
    Redo,
}

impl HistoryCommand {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Undo => "undo",
            Self::Redo => "redo",
        }
    }

    /// Map a key press to a history command.
    ///
    /// primary+Z undoes; primary+Y and primary+Shift+Z redo.
    #[must_use]
    pub fn from_key(combo: KeyCombo) -> Option<Self> {
        if !combo.primary {
            return None;
        }
        match combo.key.to_ascii_lowercase() {
            'z' if combo.shift => Some(Self::Redo),
            'z' => Some(Self::Undo),
            'y' => Some(Self::Redo),
            _ => None,
        }
    }
}

/// A key press. `primary` is Ctrl, or Cmd on macOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCombo {
    pub key: char,
    pub primary: bool,
    pub shift: bool,
}

impl KeyCombo {
    #[must_use]
    pub fn primary(key: char) -> Self {
        Self { key, primary: true, shift: false }
    }

    #[must_use]
    pub fn primary_shift(key: char) -> Self {
        Self { key, primary: true, shift: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Nothing to undo or redo.
    Unavailable,
    /// Another history request for the resource is still running.
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    Applied(RevisionPointer),
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryEvent {
    /// Server state changed; re-fetch this resource.
    Changed { resource_id: String, command: HistoryCommand, pointer: RevisionPointer },
    Refreshed { resource_id: String, pointer: RevisionPointer },
    Failed { resource_id: String, error: HistoryError },
}

// =============================================================================
// TRACKER
// =============================================================================

/// Releases the per-resource in-flight slot on drop.
struct InFlightGuard {
    busy: Arc<Mutex<HashSet<String>>>,
    resource_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.resource_id);
    }
}

#[derive(Clone)]
pub struct RevisionTracker {
    api: Arc<dyn HistoryApi>,
    request_timeout: Duration,
    pointers: Arc<Mutex<HashMap<String, RevisionPointer>>>,
    busy: Arc<Mutex<HashSet<String>>>,
    events: EventEmitter<HistoryEvent>,
}

impl RevisionTracker {
    #[must_use]
    pub fn new(api: Arc<dyn HistoryApi>, request_timeout: Duration) -> Self {
        Self {
            api,
            request_timeout,
            pointers: Arc::new(Mutex::new(HashMap::new())),
            busy: Arc::new(Mutex::new(HashSet::new())),
            events: EventEmitter::new(),
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventEmitter<HistoryEvent> {
        &self.events
    }

    fn pointers(&self) -> MutexGuard<'_, HashMap<String, RevisionPointer>> {
        self.pointers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_begin(&self, resource_id: &str) -> Option<InFlightGuard> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(resource_id.to_owned()) {
            return None;
        }
        Some(InFlightGuard { busy: Arc::clone(&self.busy), resource_id: resource_id.to_owned() })
    }

    async fn bounded<T>(&self, request: impl Future<Output = Result<T, HistoryError>>) -> Result<T, HistoryError> {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(HistoryError::Timeout(self.request_timeout)),
        }
    }

    fn fail(&self, resource_id: &str, error: HistoryError) -> HistoryError {
        warn!(resource_id, error = %error, code = error.error_code(), "history: request failed");
        self.events
            .emit(CHANNEL_HISTORY, &HistoryEvent::Failed { resource_id: resource_id.to_owned(), error: error.clone() });
        error
    }

    // -------------------------------------------------------------------------
    // QUERIES
    // -------------------------------------------------------------------------

    /// Last known pointer; the empty-history pointer before any refresh.
    #[must_use]
    pub fn pointer(&self, resource_id: &str) -> RevisionPointer {
        self.pointers().get(resource_id).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn can_undo(&self, resource_id: &str) -> bool {
        self.pointer(resource_id).can_undo
    }

    #[must_use]
    pub fn can_redo(&self, resource_id: &str) -> bool {
        self.pointer(resource_id).can_redo
    }

    #[must_use]
    pub fn is_busy(&self, resource_id: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(resource_id)
    }

    /// Drop the cached pointer, e.g. when the view leaves the resource.
    pub fn forget(&self, resource_id: &str) {
        self.pointers().remove(resource_id);
    }

    // -------------------------------------------------------------------------
    // OPERATIONS
    // -------------------------------------------------------------------------

    /// Re-derive the pointer from the server's revision list.
    ///
    /// # Errors
    ///
    /// Returns the query error; the last known-good pointer is kept.
    pub async fn refresh(&self, resource_id: &str) -> Result<RevisionPointer, HistoryError> {
        let revisions = match self.bounded(self.api.list_revisions(resource_id)).await {
            Ok(revisions) => revisions,
            Err(err) => return Err(self.fail(resource_id, err)),
        };
        let pointer = RevisionPointer::from_revisions(&revisions);
        self.pointers().insert(resource_id.to_owned(), pointer);
        debug!(
            resource_id,
            current = pointer.current_version,
            can_undo = pointer.can_undo,
            can_redo = pointer.can_redo,
            "history: pointer refreshed"
        );
        self.events
            .emit(CHANNEL_HISTORY, &HistoryEvent::Refreshed { resource_id: resource_id.to_owned(), pointer });
        Ok(pointer)
    }

    /// # Errors
    ///
    /// See [`Self::run`].
    pub async fn undo(&self, resource_id: &str) -> Result<HistoryOutcome, HistoryError> {
        self.run(resource_id, HistoryCommand::Undo).await
    }

    /// # Errors
    ///
    /// See [`Self::run`].
    pub async fn redo(&self, resource_id: &str) -> Result<HistoryOutcome, HistoryError> {
        self.run(resource_id, HistoryCommand::Redo).await
    }

    /// Dispatch a key press through the guarded handlers.
    ///
    /// Returns `None` when the combo is not a history binding.
    pub async fn handle_key(
        &self,
        resource_id: &str,
        combo: KeyCombo,
    ) -> Option<Result<HistoryOutcome, HistoryError>> {
        let command = HistoryCommand::from_key(combo)?;
        Some(self.run(resource_id, command).await)
    }

    /// Run `command` unless it is unavailable or another request for the
    /// resource is in flight, then refresh the pointer.
    ///
    /// # Errors
    ///
    /// Returns the command's error, or the refresh error when the command
    /// succeeded but the follow-up query did not. `Changed` is emitted in
    /// the latter case since the server state did move.
    pub async fn run(&self, resource_id: &str, command: HistoryCommand) -> Result<HistoryOutcome, HistoryError> {
        if !self.pointer(resource_id).allows(command) {
            debug!(resource_id, command = command.as_str(), "history: nothing to apply");
            return Ok(HistoryOutcome::Skipped(SkipReason::Unavailable));
        }
        let Some(_guard) = self.try_begin(resource_id) else {
            debug!(resource_id, command = command.as_str(), "history: request already in flight");
            return Ok(HistoryOutcome::Skipped(SkipReason::InFlight));
        };

        // PHASE: APPLY COMMAND
        let request = match command {
            HistoryCommand::Undo => self.api.undo(resource_id),
            HistoryCommand::Redo => self.api.redo(resource_id),
        };
        if let Err(err) = self.bounded(request).await {
            return Err(self.fail(resource_id, err));
        }
        info!(resource_id, command = command.as_str(), "history: applied");

        // PHASE: RE-DERIVE POINTER
        let refreshed = self.refresh(resource_id).await;
        let pointer = match &refreshed {
            Ok(pointer) => *pointer,
            Err(_) => self.pointer(resource_id),
        };
        self.events.emit(
            CHANNEL_HISTORY,
            &HistoryEvent::Changed { resource_id: resource_id.to_owned(), command, pointer },
        );
        refreshed.map(HistoryOutcome::Applied)
    }
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
