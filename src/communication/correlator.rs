//! Request/response correlation.
//!
//! A caller registers a one-shot waiter for the [`EventKey`] that answers its
//! command, sends the command, then races the waiter against a deadline fixed
//! when the request was issued. Every inbound event resolves all waiters on
//! its key; an event nobody waits for is a no-op.

use crate::communication::event_system::{BoardEvent, EventKey};
use crate::error::FirmataError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};

#[derive(Debug)]
struct Waiter {
    id: u64,
    slot: oneshot::Sender<BoardEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    waiters: Mutex<HashMap<EventKey, Vec<Waiter>>>,
    next_id: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct Correlator {
    inner: Arc<Inner>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<EventKey, Vec<Waiter>>> {
        self.inner.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter for `key`. Dropping the returned request retires it.
    pub fn register(&self, key: EventKey) -> PendingRequest {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = oneshot::channel();
        self.waiters().entry(key).or_default().push(Waiter { id, slot });
        PendingRequest { key, id, rx: Some(rx), correlator: self.clone() }
    }

    /// Complete every waiter registered for the event's key. Returns how many
    /// were still listening.
    pub fn resolve(&self, event: &BoardEvent) -> usize {
        let key = event.key();
        let Some(waiters) = self.waiters().remove(&key) else {
            return 0;
        };
        let resolved = waiters
            .into_iter()
            .map(|waiter| waiter.slot.send(event.clone()).is_ok())
            .filter(|delivered| *delivered)
            .count();
        if resolved > 0 {
            tracing::trace!("resolved {} waiter(s) for {}", resolved, key);
        }
        resolved
    }

    /// Number of outstanding waiters across all keys.
    pub fn pending(&self) -> usize {
        self.waiters().values().map(Vec::len).sum()
    }

    /// Drop every waiter; their callers observe [`FirmataError::Disconnected`].
    pub fn cancel_all(&self) {
        let cancelled: usize = self.waiters().drain().map(|(_, w)| w.len()).sum();
        if cancelled > 0 {
            tracing::debug!("cancelled {} pending request(s)", cancelled);
        }
    }

    fn retire(&self, key: EventKey, id: u64) {
        let mut waiters = self.waiters();
        if let Some(list) = waiters.get_mut(&key) {
            list.retain(|waiter| waiter.id != id);
            if list.is_empty() {
                waiters.remove(&key);
            }
        }
    }

    /// Register for `key`, run `send`, then wait until the event arrives or
    /// `timeout` has elapsed since the call began.
    pub async fn issue<F>(&self, key: EventKey, timeout: Duration, send: F) -> Result<BoardEvent, FirmataError>
    where
        F: Future<Output = Result<(), FirmataError>>,
    {
        let deadline = Instant::now() + timeout;
        let request = self.register(key);
        send.await?;
        request.wait_until(deadline, timeout).await
    }
}

/// A registered waiter. Resolves once, or is retired on drop.
#[derive(Debug)]
pub struct PendingRequest {
    key: EventKey,
    id: u64,
    rx: Option<oneshot::Receiver<BoardEvent>>,
    correlator: Correlator,
}

impl PendingRequest {
    pub fn key(&self) -> EventKey {
        self.key
    }

    pub async fn wait(self, timeout: Duration) -> Result<BoardEvent, FirmataError> {
        self.wait_until(Instant::now() + timeout, timeout).await
    }

    async fn wait_until(mut self, deadline: Instant, waited: Duration) -> Result<BoardEvent, FirmataError> {
        let Some(rx) = self.rx.take() else {
            return Err(FirmataError::Disconnected);
        };
        match timeout_at(deadline, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(FirmataError::Disconnected),
            Err(_) => {
                tracing::warn!("request for {} timed out after {:?}", self.key, waited);
                Err(FirmataError::Timeout { key: self.key, waited })
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.correlator.retire(self.key, self.id);
    }
}
