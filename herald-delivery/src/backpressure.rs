//! Concurrency cap for outbound transport calls
//!
//! A [`BackpressurePermit`] holds one slot of the semaphore and gives it back
//! when dropped, so every exit path of a delivery releases exactly once.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Maximum concurrent transport calls
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

const fn default_max_concurrency() -> usize {
    5
}

/// Point-in-time view for operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureStatus {
    pub active_jobs: u64,
    /// Claimed by a worker but not yet dispatched or deferred
    pub queued_jobs: u64,
    pub max_concurrency: u64,
}

#[derive(Debug)]
pub struct BackpressureManager {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    queued: Arc<AtomicU64>,
}

impl BackpressureManager {
    #[must_use]
    pub fn new(config: &BackpressureConfig) -> Self {
        let max_concurrency = config.max_concurrency.max(1);

        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            queued: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Take a slot if one is free. Never waits.
    #[must_use]
    pub fn try_acquire(&self) -> Option<BackpressurePermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(BackpressurePermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => {
                tracing::error!("Backpressure semaphore closed");
                None
            }
        }
    }

    /// Count a claimed job as waiting for dispatch until the ticket drops
    #[must_use]
    pub fn queue_ticket(&self) -> QueueTicket {
        self.queued.fetch_add(1, Ordering::AcqRel);
        QueueTicket {
            queued: Arc::clone(&self.queued),
        }
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.max_concurrency - self.semaphore.available_permits()
    }

    #[must_use]
    pub fn status(&self) -> BackpressureStatus {
        BackpressureStatus {
            active_jobs: self.active() as u64,
            queued_jobs: self.queued.load(Ordering::Acquire),
            max_concurrency: self.max_concurrency as u64,
        }
    }
}

impl Default for BackpressureManager {
    fn default() -> Self {
        Self::new(&BackpressureConfig::default())
    }
}

/// One in-flight slot; released on drop
#[derive(Debug)]
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct BackpressurePermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct QueueTicket {
    queued: Arc<AtomicU64>,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}
