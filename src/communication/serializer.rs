//! Outbound write discipline.
//!
//! Every submission names a resource. Submissions sharing a resource take a
//! FIFO permit on that resource's lane, so they reach the transport whole and
//! in submission order. Waiting for the permit and queue depth are both
//! bounded and fail fast.

use firmata_shared::{Transport, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;

/// Lane used by every built-in command.
pub const DEFAULT_RESOURCE: &str = "transport";

#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("Timed out after {0:?} waiting for resource '{1}'")]
    AcquireTimeout(Duration, String),
    #[error("Resource '{0}' already has {1} pending writes")]
    QueueFull(String, usize),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Write statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub bytes_sent: u64,
    pub writes: u64,
    pub errors: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct Lane {
    permit: Semaphore,
    pending: AtomicUsize,
}

impl Lane {
    fn new() -> Self {
        Self { permit: Semaphore::new(1), pending: AtomicUsize::new(0) }
    }
}

struct PendingSlot<'a>(&'a AtomicUsize);

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WriteSerializer {
    transport: Arc<dyn Transport>,
    lanes: std::sync::Mutex<HashMap<String, Arc<Lane>>>,
    acquire_timeout: Duration,
    max_pending: usize,
    clean: AtomicBool,
    stats: Mutex<WriteStats>,
}

impl WriteSerializer {
    pub fn new(transport: Arc<dyn Transport>, acquire_timeout: Duration, max_pending: usize) -> Self {
        Self {
            transport,
            lanes: std::sync::Mutex::new(HashMap::new()),
            acquire_timeout,
            max_pending: max_pending.max(1),
            clean: AtomicBool::new(true),
            stats: Mutex::new(WriteStats::default()),
        }
    }

    fn lane(&self, resource: &str) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Lane::new()))
            .clone()
    }

    /// Write `bytes` as one unit on the named resource.
    pub async fn submit(&self, resource: &str, bytes: &[u8]) -> Result<(), SerializerError> {
        let lane = self.lane(resource);
        let depth = lane.pending.fetch_add(1, Ordering::SeqCst);
        let _slot = PendingSlot(&lane.pending);
        if depth >= self.max_pending {
            self.stats.lock().await.rejected += 1;
            tracing::warn!("write queue for '{}' is full ({} pending)", resource, depth);
            return Err(SerializerError::QueueFull(resource.to_string(), self.max_pending));
        }

        let _permit = match timeout(self.acquire_timeout, lane.permit.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SerializerError::Transport(TransportError::Closed)),
            Err(_) => {
                self.stats.lock().await.rejected += 1;
                tracing::warn!("timed out waiting {:?} for '{}'", self.acquire_timeout, resource);
                return Err(SerializerError::AcquireTimeout(self.acquire_timeout, resource.to_string()));
            }
        };

        self.clean.store(false, Ordering::SeqCst);
        tracing::debug!("TX [{}] {:02X?}", resource, bytes);
        let result = self.transport.write(bytes).await;

        let mut stats = self.stats.lock().await;
        match &result {
            Ok(()) => {
                stats.writes += 1;
                stats.bytes_sent += bytes.len() as u64;
            }
            Err(e) => {
                stats.errors += 1;
                tracing::error!("write to {} failed: {}", self.transport.name(), e);
            }
        }
        result.map_err(SerializerError::from)
    }

    /// Write on the default resource.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), SerializerError> {
        self.submit(DEFAULT_RESOURCE, bytes).await
    }

    /// False once anything was written since the last [`mark_clean`](Self::mark_clean).
    pub fn is_clean(&self) -> bool {
        self.clean.load(Ordering::SeqCst)
    }

    pub fn mark_clean(&self) {
        self.clean.store(true, Ordering::SeqCst);
    }

    pub async fn stats(&self) -> WriteStats {
        self.stats.lock().await.clone()
    }
}

impl std::fmt::Debug for WriteSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSerializer")
            .field("transport", &self.transport.name())
            .field("acquire_timeout", &self.acquire_timeout)
            .field("max_pending", &self.max_pending)
            .field("clean", &self.is_clean())
            .finish()
    }
}
