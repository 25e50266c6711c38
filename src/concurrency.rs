//! Per-key counting semaphore with FIFO hand-off and bounded waits.
//!
//! `acquire` takes a slot immediately when the key is under its limit and
//! otherwise queues behind earlier callers. `release` hands the slot straight
//! to the queue head, so the active count only drops when nobody is waiting.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::ConcurrencyConfig;
use crate::error::ConcurrencyError;

#[derive(Default)]
struct Slot {
    active: usize,
    queue: VecDeque<QueuedAcquire>,
}

struct QueuedAcquire {
    id: u64,
    grant: oneshot::Sender<()>,
}

/// Bounds how many holders may use each key at once.
pub struct ConcurrencyManager {
    config: ConcurrencyConfig,
    slots: Mutex<HashMap<String, Slot>>,
    next_waiter: AtomicU64,
}

impl ConcurrencyManager {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Effective limit for `key`.
    pub fn limit(&self, key: &str) -> usize {
        self.config.limit_for(key)
    }

    /// Take a slot for `key`, waiting in FIFO order if the key is saturated.
    ///
    /// `timeout` overrides the configured default. A waiter whose deadline
    /// passes is removed from the queue and never holds the slot.
    pub async fn acquire(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<(), ConcurrencyError> {
        let timeout = timeout.or(self.config.acquire_timeout);

        let (id, mut rx) = {
            let mut slots = self.slots();
            let limit = self.config.limit_for(key);
            let slot = slots.entry(key.to_string()).or_default();
            if slot.active < limit {
                slot.active += 1;
                debug!(key, active = slot.active, limit, "Concurrency slot acquired");
                return Ok(());
            }
            let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            slot.queue.push_back(QueuedAcquire { id, grant: tx });
            debug!(key, queued = slot.queue.len(), "Waiting for concurrency slot");
            (id, rx)
        };

        let mut pending = PendingAcquire {
            manager: self,
            key,
            id,
            armed: true,
        };

        let outcome = match timeout {
            None => Ok((&mut rx).await),
            Some(limit) => tokio::time::timeout(limit, &mut rx).await,
        };
        pending.armed = false;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConcurrencyError::Closed {
                key: key.to_string(),
            }),
            Err(_) => {
                if self.remove_waiter(key, id) {
                    debug!(key, "Concurrency slot wait timed out");
                    return Err(ConcurrencyError::Timeout {
                        key: key.to_string(),
                        waited: timeout.unwrap_or_default(),
                    });
                }
                // Granted between the deadline firing and the queue check.
                rx.try_recv().map_err(|_| ConcurrencyError::Closed {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Like [`acquire`](Self::acquire), returning a guard that releases on drop.
    pub async fn permit(
        self: &Arc<Self>,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<SlotPermit, ConcurrencyError> {
        self.acquire(key, timeout).await?;
        Ok(SlotPermit {
            manager: Arc::clone(self),
            key: key.to_string(),
        })
    }

    /// Release one hold on `key`, handing it to the next live waiter if any.
    pub fn release(&self, key: &str) {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key) else {
            warn!(key, "Release called for a key with no holders");
            return;
        };

        while let Some(next) = slot.queue.pop_front() {
            if next.grant.send(()).is_ok() {
                debug!(key, waiter = next.id, "Concurrency slot handed off");
                return;
            }
        }

        if slot.active == 0 {
            warn!(key, "Release called for a key with no holders");
            return;
        }
        slot.active -= 1;
        debug!(key, active = slot.active, "Concurrency slot released");
        if slot.active == 0 {
            slots.remove(key);
        }
    }

    /// Number of current holders of `key`.
    pub fn active_count(&self, key: &str) -> usize {
        self.slots().get(key).map(|s| s.active).unwrap_or(0)
    }

    /// Number of callers queued for `key`.
    pub fn queued_count(&self, key: &str) -> usize {
        self.slots().get(key).map(|s| s.queue.len()).unwrap_or(0)
    }

    fn remove_waiter(&self, key: &str, id: u64) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        let before = slot.queue.len();
        slot.queue.retain(|w| w.id != id);
        slot.queue.len() != before
    }
}

impl Default for ConcurrencyManager {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

/// Cleans up a queued acquisition whose future is dropped mid-wait.
struct PendingAcquire<'a> {
    manager: &'a ConcurrencyManager,
    key: &'a str,
    id: u64,
    armed: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.armed && !self.manager.remove_waiter(self.key, self.id) {
            // Already granted: give the slot back.
            self.manager.release(self.key);
        }
    }
}

/// A held slot that is released when dropped.
pub struct SlotPermit {
    manager: Arc<ConcurrencyManager>,
    key: String,
}

impl SlotPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit").field("key", &self.key).finish()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.manager.release(&self.key);
    }
}
