//! Connection manager: one STOMP session per resource id.
//!
//! DESIGN
//! ======
//! The manager is a cheap `Clone` handle over shared state. Sessions live
//! in a `std::sync::Mutex<HashMap<..>>` that is never held across an
//! `.await`; all I/O happens on channels handed out by the [`Connector`].
//!
//! LIFECYCLE
//! =========
//! ```text
//! Disconnected ─connect─► Connecting ─CONNECTED─► Connected
//!      ▲                      │                       │
//!      │                timeout / refused       close / disconnect
//!      │                      ▼                       │
//!      └──────────────────  Error  ◄──────────────────┘ (reconnect exhausted)
//! ```
//!
//! - `connect` while an attempt is in flight joins the same shared future,
//!   so two callers never open two transports for one resource.
//! - The attempt itself runs as a spawned task. Callers only await its
//!   result, so dropping every caller still lets it reach `Connected` or
//!   `Error`.
//! - Attempts for one resource are spaced by `min_attempt_interval`; an
//!   early request waits out the window instead of being dropped.
//! - Each successful install bumps the session `generation`. Reader tasks
//!   carry the generation they were spawned for and go quiet once stale.
//! - `disconnect` bumps the session `epoch` and aborts the attempt task;
//!   joined callers see `Aborted`, and an attempt that still completes
//!   under an older epoch discards its link.
//!
//! RECONNECT
//! =========
//! When a `Connected` link closes without `disconnect`, a background task
//! retries with capped exponential backoff plus up to 10% jitter. After
//! `max_attempts` failures the session is parked in `Error` until the
//! next explicit `connect`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use frames::{Command, Frame};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::events::EventEmitter;
use crate::net::transport::{Connector, Link, LinkEvent, WsConnector};
use crate::net::types::{
    CHANNEL_STATE, ConnectionState, ErrorCode, InboundMessage, SyncEvent, chat_destination,
};
use crate::services::router::{TopicRouter, dispatch};

// =============================================================================
// ERRORS
// =============================================================================

/// The broker refused or garbled the STOMP session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("broker error: {message}")]
    Rejected { message: String, details: String },
    #[error("unexpected handshake reply: {0}")]
    Handshake(String),
}

impl ProtocolError {
    /// Build from a STOMP `ERROR` frame.
    #[must_use]
    pub fn from_frame(frame: &Frame) -> Self {
        Self::Rejected {
            message: frame.header("message").unwrap_or("broker error").to_owned(),
            details: frame.body.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("connection attempt aborted by disconnect")]
    Aborted,
    #[error("connection manager disposed")]
    Disposed,
}

impl ErrorCode for ConnectionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "E_CONNECT_TIMEOUT",
            Self::Transport(_) => "E_TRANSPORT",
            Self::Protocol(_) => "E_PROTOCOL",
            Self::ReconnectExhausted(_) => "E_RECONNECT_EXHAUSTED",
            Self::Aborted => "E_ABORTED",
            Self::Disposed => "E_DISPOSED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_) | Self::ReconnectExhausted(_))
    }
}

// =============================================================================
// SESSION
// =============================================================================

type PendingConnect = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;

struct Session {
    state: ConnectionState,
    router: TopicRouter,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
    reader: Option<JoinHandle<()>>,
    pending: Option<PendingConnect>,
    attempt_task: Option<AbortHandle>,
    last_attempt_at: Option<Instant>,
    reconnect_attempts: u32,
    reconnect_task: Option<JoinHandle<()>>,
    /// Bumped when a reconnect loop starts or a connect succeeds.
    reconnect_token: u64,
    /// Bumped by `disconnect`.
    epoch: u64,
    /// Bumped per installed link.
    generation: u64,
}

impl Session {
    fn new(router: TopicRouter) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            router,
            outbound: None,
            reader: None,
            pending: None,
            attempt_task: None,
            last_attempt_at: None,
            reconnect_attempts: 0,
            reconnect_task: None,
            reconnect_token: 0,
            epoch: 0,
            generation: 0,
        }
    }

    /// Move to `next`, returning the event to emit if anything changed.
    fn transition(&mut self, resource_id: &str, next: ConnectionState) -> Option<SyncEvent> {
        if self.state == next {
            return None;
        }
        debug!(%resource_id, from = %self.state, to = %next, "connection: state");
        self.state = next;
        Some(SyncEvent::StateChanged { resource_id: resource_id.to_owned(), state: next })
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.attempt_task.take() {
            task.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

struct ManagerInner {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    events: EventEmitter<SyncEvent>,
    sessions: Mutex<HashMap<String, Session>>,
    disposed: AtomicBool,
}

impl ManagerInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_state(&self, event: Option<SyncEvent>) {
        if let Some(event) = event {
            self.events.emit(CHANNEL_STATE, &event);
        }
    }

    fn emit_error(&self, resource_id: &str, err: &ConnectionError) {
        dispatch(&self.events, &InboundMessage::error_from(resource_id, err));
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let sessions = self.sessions.get_mut().unwrap_or_else(PoisonError::into_inner);
        for session in sessions.values_mut() {
            session.abort_tasks();
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Owns the real-time sessions of every resource the application watches.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("ws_url", &self.inner.config.ws_url)
            .field("sessions", &self.inner.sessions().len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: SyncConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                connector,
                events: EventEmitter::new(),
                sessions: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Manager speaking STOMP over WebSocket to `config.ws_url`.
    #[must_use]
    pub fn with_websocket(config: SyncConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.heartbeat));
        Self::new(config, connector)
    }

    /// Emitter carrying state changes and inbound messages.
    #[must_use]
    pub fn events(&self) -> &EventEmitter<SyncEvent> {
        &self.inner.events
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Bring the session for `resource_id` to `Connected`.
    ///
    /// # Errors
    ///
    /// Returns the [`ConnectionError`] that stopped the attempt. Callers
    /// joining an in-flight attempt receive the same result.
    pub async fn connect(&self, resource_id: &str) -> Result<(), ConnectionError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Disposed);
        }

        let (pending, event) = {
            let mut sessions = self.inner.sessions();
            let session = sessions
                .entry(resource_id.to_owned())
                .or_insert_with(|| Session::new(TopicRouter::new(self.inner.config.topics.clone())));

            if session.state == ConnectionState::Connected {
                return Ok(());
            }
            if let Some(pending) = &session.pending {
                debug!(%resource_id, "connection: joining in-flight attempt");
                (pending.clone(), None)
            } else {
                let task = tokio::spawn(attempt(Arc::clone(&self.inner), resource_id.to_owned(), session.epoch));
                session.attempt_task = Some(task.abort_handle());
                let fresh = join_attempt(Arc::clone(&self.inner), resource_id.to_owned(), session.epoch, task)
                    .boxed()
                    .shared();
                session.pending = Some(fresh.clone());
                (fresh, session.transition(resource_id, ConnectionState::Connecting))
            }
        };

        self.inner.emit_state(event);
        pending.await
    }

    /// Tear down the session for `resource_id`. Safe to call repeatedly.
    pub fn disconnect(&self, resource_id: &str) {
        let event = {
            let mut sessions = self.inner.sessions();
            let Some(session) = sessions.get_mut(resource_id) else {
                return;
            };
            session.epoch += 1;
            session.pending = None;
            session.reconnect_attempts = 0;
            if let Some(task) = session.attempt_task.take() {
                task.abort();
            }
            if let Some(task) = session.reconnect_task.take() {
                task.abort();
            }
            match session.outbound.take() {
                Some(outbound) => {
                    session.router.unsubscribe_all(&outbound);
                    if outbound.send(Frame::disconnect(None)).is_err() {
                        debug!(%resource_id, "connection: link already closed on disconnect");
                    }
                }
                None => session.router.forget_all(),
            }
            if let Some(reader) = session.reader.take() {
                reader.abort();
            }
            session.transition(resource_id, ConnectionState::Disconnected)
        };

        if event.is_some() {
            info!(%resource_id, "connection: disconnected");
        }
        self.inner.emit_state(event);
    }

    /// Disconnect every session and refuse further connects.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = self.inner.sessions().keys().cloned().collect();
        for id in &ids {
            self.disconnect(id);
        }
        self.inner.sessions().clear();
        info!(sessions = ids.len(), "connection: manager disposed");
    }

    /// Publish `body` to `destination` on the resource's session.
    ///
    /// Returns `false` (and logs) when the session is not connected.
    pub fn send(&self, resource_id: &str, destination: &str, body: &Value) -> bool {
        let sessions = self.inner.sessions();
        let outbound = sessions
            .get(resource_id)
            .filter(|s| s.state == ConnectionState::Connected)
            .and_then(|s| s.outbound.as_ref());
        let Some(outbound) = outbound else {
            warn!(%resource_id, %destination, "connection: send while not connected; dropped");
            return false;
        };
        if outbound.send(Frame::send(destination, body.to_string())).is_err() {
            warn!(%resource_id, %destination, "connection: link closed under send; dropped");
            return false;
        }
        true
    }

    /// Submit a chat message for the assistant working on `resource_id`.
    pub fn send_chat(&self, resource_id: &str, message: &str) -> bool {
        let body = serde_json::json!({ "message": message, "itineraryId": resource_id });
        self.send(resource_id, &chat_destination(resource_id), &body)
    }

    #[must_use]
    pub fn state(&self, resource_id: &str) -> ConnectionState {
        self.inner
            .sessions()
            .get(resource_id)
            .map_or(ConnectionState::Disconnected, |s| s.state)
    }

    #[must_use]
    pub fn is_connected(&self, resource_id: &str) -> bool {
        self.state(resource_id) == ConnectionState::Connected
    }

    /// Destinations currently subscribed for `resource_id`, sorted.
    #[must_use]
    pub fn subscriptions(&self, resource_id: &str) -> Vec<String> {
        let sessions = self.inner.sessions();
        let mut destinations: Vec<String> = sessions
            .get(resource_id)
            .map(|s| s.router.subscriptions().values().map(|h| h.destination.clone()).collect())
            .unwrap_or_default();
        destinations.sort();
        destinations
    }

    #[must_use]
    pub fn reconnect_attempts(&self, resource_id: &str) -> u32 {
        self.inner
            .sessions()
            .get(resource_id)
            .map_or(0, |s| s.reconnect_attempts)
    }
}

// =============================================================================
// CONNECT ATTEMPT
// =============================================================================

/// Await a spawned attempt. A panicked attempt is recorded as a transport
/// failure so the session does not stay `Connecting`.
async fn join_attempt(
    inner: Arc<ManagerInner>,
    resource_id: String,
    epoch: u64,
    task: JoinHandle<Result<(), ConnectionError>>,
) -> Result<(), ConnectionError> {
    match task.await {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Err(ConnectionError::Aborted),
        Err(err) => {
            let failure = ConnectionError::Transport(format!("connect task failed: {err}"));
            install(&inner, &resource_id, epoch, Err(failure))
        }
    }
}

async fn attempt(inner: Arc<ManagerInner>, resource_id: String, epoch: u64) -> Result<(), ConnectionError> {
    let wait = {
        let sessions = inner.sessions();
        sessions
            .get(&resource_id)
            .and_then(|s| s.last_attempt_at)
            .map_or(Duration::ZERO, |at| inner.config.min_attempt_interval.saturating_sub(at.elapsed()))
    };
    if !wait.is_zero() {
        debug!(%resource_id, wait_ms = wait.as_millis(), "connection: throttling attempt");
        tokio::time::sleep(wait).await;
    }

    {
        let mut sessions = inner.sessions();
        match sessions.get_mut(&resource_id) {
            Some(session) if session.epoch == epoch => session.last_attempt_at = Some(Instant::now()),
            _ => return Err(ConnectionError::Aborted),
        }
    }

    info!(%resource_id, url = %inner.config.ws_url, "connection: connecting");
    let timeout = inner.config.connect_timeout;
    let result = match tokio::time::timeout(timeout, open_and_handshake(&inner)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout(timeout)),
    };
    install(&inner, &resource_id, epoch, result)
}

async fn open_and_handshake(inner: &ManagerInner) -> Result<Link, ConnectionError> {
    let config = &inner.config;
    let mut link = inner
        .connector
        .open(&config.ws_url)
        .await
        .map_err(|e| ConnectionError::Transport(e.to_string()))?;

    let heartbeat_ms = u64::try_from(config.heartbeat.as_millis()).unwrap_or(u64::MAX);
    let mut connect = Frame::connect(config.stomp_host(), (heartbeat_ms, 0));
    if let Some(token) = &config.auth_token {
        connect = connect.with_header("Authorization", format!("Bearer {token}"));
    }
    if link.outbound.send(connect).is_err() {
        return Err(ConnectionError::Transport("link closed before handshake".into()));
    }

    loop {
        match link.inbound.recv().await {
            Some(LinkEvent::Frame(frame)) => match frame.command {
                Command::Connected => return Ok(link),
                Command::Error => return Err(ProtocolError::from_frame(&frame).into()),
                other => debug!(command = %other, "connection: ignoring frame before CONNECTED"),
            },
            Some(LinkEvent::Malformed { error, .. }) => {
                return Err(ProtocolError::Handshake(error.to_string()).into());
            }
            Some(LinkEvent::Closed { reason }) => {
                return Err(ConnectionError::Transport(
                    reason.unwrap_or_else(|| "closed during handshake".into()),
                ));
            }
            None => return Err(ConnectionError::Transport("closed during handshake".into())),
        }
    }
}

/// Record the attempt's outcome on the session, if it still belongs there.
fn install(
    inner: &Arc<ManagerInner>,
    resource_id: &str,
    epoch: u64,
    result: Result<Link, ConnectionError>,
) -> Result<(), ConnectionError> {
    let (event, outcome) = {
        let mut sessions = inner.sessions();
        let Some(session) = sessions.get_mut(resource_id) else {
            return Err(ConnectionError::Aborted);
        };
        if session.epoch != epoch || inner.disposed.load(Ordering::SeqCst) {
            debug!(%resource_id, "connection: attempt superseded by disconnect");
            return Err(ConnectionError::Aborted);
        }
        session.pending = None;
        session.attempt_task = None;

        match result {
            Ok(Link { outbound, inbound }) => {
                session.generation += 1;
                session.reconnect_attempts = 0;
                session.reconnect_token += 1;
                session.reconnect_task = None;
                let count = session.router.subscribe_all(resource_id, &outbound);
                let reader = tokio::spawn(read_loop(
                    Arc::downgrade(inner),
                    resource_id.to_owned(),
                    session.generation,
                    inbound,
                ));
                if let Some(old) = session.reader.replace(reader) {
                    old.abort();
                }
                session.outbound = Some(outbound);
                info!(%resource_id, subscriptions = count, "connection: connected");
                (session.transition(resource_id, ConnectionState::Connected), Ok(()))
            }
            Err(err) => {
                warn!(%resource_id, error = %err, "connection: attempt failed");
                (session.transition(resource_id, ConnectionState::Error), Err(err))
            }
        }
    };

    inner.emit_state(event);
    if let Err(err) = &outcome {
        inner.emit_error(resource_id, err);
    }
    outcome
}

// =============================================================================
// READER
// =============================================================================

async fn read_loop(
    inner: Weak<ManagerInner>,
    resource_id: String,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            LinkEvent::Frame(frame) => match frame.command {
                Command::Message => {
                    let accepted = inner
                        .sessions()
                        .get(&resource_id)
                        .is_some_and(|s| s.generation == generation && s.router.accepts(&frame));
                    if accepted {
                        TopicRouter::on_frame(&resource_id, &frame, &inner.events);
                    } else {
                        debug!(%resource_id, destination = frame.destination().unwrap_or("-"), "connection: message for inactive subscription");
                    }
                }
                Command::Error => {
                    let err = ConnectionError::from(ProtocolError::from_frame(&frame));
                    warn!(%resource_id, error = %err, "connection: broker error frame");
                    inner.emit_error(&resource_id, &err);
                }
                other => debug!(%resource_id, command = %other, "connection: ignoring frame"),
            },
            LinkEvent::Malformed { raw, error } => {
                TopicRouter::on_malformed(&resource_id, &raw, error, &inner.events);
            }
            LinkEvent::Closed { reason } => {
                handle_closed(&inner, &resource_id, generation, reason);
                return;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        handle_closed(&inner, &resource_id, generation, None);
    }
}

fn handle_closed(inner: &Arc<ManagerInner>, resource_id: &str, generation: u64, reason: Option<String>) {
    let event = {
        let mut sessions = inner.sessions();
        let Some(session) = sessions.get_mut(resource_id) else {
            return;
        };
        if session.generation != generation || session.outbound.is_none() {
            return;
        }
        let was_connected = session.state == ConnectionState::Connected;
        session.outbound = None;
        session.reader = None;
        session.router.forget_all();
        warn!(%resource_id, reason = reason.as_deref().unwrap_or("-"), "connection: link closed");

        let policy = inner.config.reconnect;
        if was_connected && policy.is_enabled() && !inner.disposed.load(Ordering::SeqCst) {
            session.reconnect_token += 1;
            let task = tokio::spawn(reconnect_loop(
                Arc::downgrade(inner),
                resource_id.to_owned(),
                session.epoch,
                session.reconnect_token,
            ));
            if let Some(old) = session.reconnect_task.replace(task) {
                old.abort();
            }
        }
        session.transition(resource_id, ConnectionState::Disconnected)
    };
    inner.emit_state(event);
}

// =============================================================================
// RECONNECT
// =============================================================================

async fn reconnect_loop(inner: Weak<ManagerInner>, resource_id: String, epoch: u64, token: u64) {
    loop {
        let delay = {
            let Some(strong) = inner.upgrade() else {
                return;
            };
            let policy = strong.config.reconnect;
            let (attempt, event) = {
                let mut sessions = strong.sessions();
                let Some(session) = sessions.get_mut(&resource_id) else {
                    return;
                };
                if session.epoch != epoch || session.reconnect_token != token {
                    return;
                }
                session.reconnect_attempts += 1;
                let attempt = session.reconnect_attempts;
                let event = (attempt > policy.max_attempts)
                    .then(|| session.transition(&resource_id, ConnectionState::Error))
                    .flatten();
                (attempt, event)
            };

            if attempt > policy.max_attempts {
                let err = ConnectionError::ReconnectExhausted(policy.max_attempts);
                warn!(%resource_id, attempts = policy.max_attempts, "connection: reconnect attempts exhausted");
                strong.emit_state(event);
                strong.emit_error(&resource_id, &err);
                return;
            }
            with_jitter(policy.delay_for(attempt))
        };

        debug!(%resource_id, delay_ms = delay.as_millis(), "connection: reconnect scheduled");
        tokio::time::sleep(delay).await;

        let Some(strong) = inner.upgrade() else {
            return;
        };
        let manager = ConnectionManager { inner: strong };
        match manager.connect(&resource_id).await {
            Ok(()) => return,
            Err(ConnectionError::Protocol(err)) => {
                warn!(%resource_id, error = %err, "connection: broker refused reconnect");
                return;
            }
            Err(ConnectionError::Aborted | ConnectionError::Disposed) => return,
            Err(err) => debug!(%resource_id, error = %err, "connection: reconnect attempt failed"),
        }
    }
}

/// `delay` plus up to 10% random jitter.
fn with_jitter(delay: Duration) -> Duration {
    let spread = u64::try_from(delay.as_millis() / 10).unwrap_or(u64::MAX);
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
