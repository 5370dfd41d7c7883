//! In-process listener registry.
//!
//! DESIGN
//! ======
//! Listeners register against a named channel and receive every payload
//! emitted on it, synchronously and in registration order. A panicking
//! listener is caught and logged; the remaining listeners still run and
//! the emitting code path never sees the panic.
//!
//! Async consumers use [`EventEmitter::listen`], which bridges a channel
//! into an unbounded mpsc receiver and unregisters itself on drop.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error};

/// Handle returned by [`EventEmitter::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct EmitterInner<E> {
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Vec<(ListenerId, Listener<E>)>>>,
}

/// Cheaply cloneable fan-out registry for payloads of type `E`.
pub struct EventEmitter<E> {
    inner: Arc<EmitterInner<E>>,
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventEmitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.inner.channels.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventEmitter")
            .field("channels", &channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<E> EventEmitter<E> {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(EmitterInner { next_id: AtomicU64::new(1), channels: Mutex::new(HashMap::new()) }) }
    }

    /// Register `listener` on `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.inner.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(event.to_owned())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener. Returns `false` when it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut channels = self.inner.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(listeners) = channels.get_mut(event) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            channels.remove(event);
        }
        removed
    }

    /// Invoke every listener on `event` with `payload`.
    ///
    /// Returns the number of listeners that completed without panicking.
    pub fn emit(&self, event: &str, payload: &E) -> usize {
        // Snapshot so listeners may call on/off without deadlocking.
        let snapshot: Vec<(ListenerId, Listener<E>)> = {
            let channels = self.inner.channels.lock().unwrap_or_else(PoisonError::into_inner);
            match channels.get(event) {
                Some(listeners) => listeners.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_owned());
                    error!(event, listener = id.0, %reason, "event listener panicked");
                }
            }
        }
        delivered
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        let channels = self.inner.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(event).map_or(0, Vec::len)
    }

    /// Remove every listener on every channel.
    pub fn clear(&self) {
        let mut channels = self.inner.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.clear();
    }
}

impl<E: Clone + Send + 'static> EventEmitter<E> {
    /// Receive `event` payloads on an async stream.
    #[must_use]
    pub fn listen(&self, event: &str) -> EventStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = event.to_owned();
        let id = self.on(event, move |payload: &E| {
            if tx.send(payload.clone()).is_err() {
                debug!(event = %channel, "events: stream closed; payload dropped");
            }
        });
        EventStream { rx, id, event: event.to_owned(), emitter: Arc::downgrade(&self.inner) }
    }
}

/// Async receiver bound to one emitter channel. Unregisters on drop.
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<E>,
    id: ListenerId,
    event: String,
    emitter: Weak<EmitterInner<E>>,
}

impl<E> EventStream<E> {
    /// Next payload, or `None` once the emitter is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Next already-delivered payload, if any.
    pub fn try_recv(&mut self) -> Option<E> {
        match self.rx.try_recv() {
            Ok(payload) => Some(payload),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                debug!(event = %self.event, "events: emitter gone");
                None
            }
        }
    }
}

impl<E> Drop for EventStream<E> {
    fn drop(&mut self) {
        if let Some(inner) = self.emitter.upgrade() {
            EventEmitter { inner }.off(&self.event, self.id);
        }
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
