//! Per-proxy admission control.
//!
//! Each proxy has at most `max_concurrent` attempts in flight. An acquire on a
//! saturated proxy is redirected to the best-ranked candidate with spare
//! capacity; if every candidate is saturated the request waits in the proxy's
//! FIFO queue until a slot is handed over or the queue timeout expires.
//!
//! Slots are released by dropping the returned [`SlotGuard`], so every exit
//! path of an attempt (success, error, timeout, cancellation, or a dropped
//! future) gives its slot back. Hand-over to a waiter happens under the same
//! lock as the release, so no other acquire can interleave.

use crate::catalog::ProxyDescriptor;
use crate::error::{FetchError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

struct Waiter {
    id: u64,
    enqueued_at: Instant,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct SlotState {
    active: usize,
    queue: VecDeque<Waiter>,
}

impl SlotState {
    /// Free slot with nobody queued ahead.
    fn has_capacity(&self, max: usize) -> bool {
        self.active < max && self.queue.is_empty()
    }
}

type SlotMap = HashMap<String, SlotState>;

struct PoolInner {
    slots: Mutex<SlotMap>,
    max_concurrent: AtomicUsize,
    queue_timeout_ms: AtomicU64,
    next_waiter: AtomicU64,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, SlotMap> {
        self.slots.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::Relaxed)
    }

    /// Hands the slot to the oldest live waiter, or frees it.
    fn release_locked(&self, slots: &mut SlotMap, name: &str) {
        let Some(state) = slots.get_mut(name) else {
            warn!(proxy = %name, "Release for a proxy without slot state");
            return;
        };

        if state.active <= self.max_concurrent() {
            while let Some(waiter) = state.queue.pop_front() {
                if waiter.grant.send(()).is_ok() {
                    trace!(
                        proxy = %name,
                        waiter = waiter.id,
                        waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
                        "Slot handed to queued request"
                    );
                    return;
                }
            }
        }

        state.active = state.active.saturating_sub(1);
    }
}

/// Per-proxy bounded concurrency with FIFO wait queues.
#[derive(Clone)]
pub struct ConcurrencyPool {
    inner: Arc<PoolInner>,
}

impl ConcurrencyPool {
    pub fn new(max_concurrent: usize, queue_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(HashMap::new()),
                max_concurrent: AtomicUsize::new(max_concurrent.max(1)),
                queue_timeout_ms: AtomicU64::new(queue_timeout.as_millis() as u64),
                next_waiter: AtomicU64::new(0),
            }),
        }
    }

    /// Updates the limits used by subsequent admissions.
    ///
    /// Capacity freed by a raised limit goes to queued requests first.
    pub fn set_limits(&self, max_concurrent: usize, queue_timeout: Duration) {
        let max = max_concurrent.max(1);
        let mut slots = self.inner.lock();
        self.inner.max_concurrent.store(max, Ordering::Relaxed);
        self.inner
            .queue_timeout_ms
            .store(queue_timeout.as_millis() as u64, Ordering::Relaxed);

        for (name, state) in slots.iter_mut() {
            while state.active < max {
                let Some(waiter) = state.queue.pop_front() else {
                    break;
                };
                if waiter.grant.send(()).is_ok() {
                    state.active += 1;
                    trace!(proxy = %name, waiter = waiter.id, "Slot granted after limit change");
                }
            }
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent()
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.queue_timeout_ms.load(Ordering::Relaxed))
    }

    /// Attempts in flight against `name`.
    pub fn active(&self, name: &str) -> usize {
        self.inner.lock().get(name).map(|s| s.active).unwrap_or(0)
    }

    /// Requests waiting for a slot on `name`.
    pub fn queued(&self, name: &str) -> usize {
        self.inner.lock().get(name).map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Takes a slot without waiting: `name` first, then `candidates` in order.
    pub fn try_acquire(
        &self,
        name: &str,
        candidates: &[Arc<ProxyDescriptor>],
    ) -> Option<SlotGuard> {
        let mut slots = self.inner.lock();
        self.admit_locked(&mut slots, name, candidates)
    }

    /// Acquires a slot for an attempt against `name`.
    ///
    /// The returned guard may name a different proxy when the request was
    /// redirected to a candidate with spare capacity.
    pub async fn acquire(
        &self,
        name: &str,
        candidates: &[Arc<ProxyDescriptor>],
    ) -> Result<SlotGuard> {
        let mut pending = {
            let mut slots = self.inner.lock();
            if let Some(guard) = self.admit_locked(&mut slots, name, candidates) {
                return Ok(guard);
            }

            let (tx, rx) = oneshot::channel();
            let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
            let state = slots.entry(name.to_string()).or_default();
            state.queue.push_back(Waiter {
                id,
                enqueued_at: Instant::now(),
                grant: tx,
            });
            debug!(
                proxy = %name,
                waiter = id,
                queued = state.queue.len(),
                "All candidates saturated, queueing request"
            );
            PendingAdmission {
                pool: self.inner.clone(),
                name: name.to_string(),
                id,
                rx: Some(rx),
            }
        };

        let timeout = self.queue_timeout();
        let granted = match pending.rx.as_mut() {
            Some(rx) => matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(()))),
            None => false,
        };

        if granted || pending.withdraw() {
            pending.rx = None;
            return Ok(self.guard(name));
        }

        debug!(proxy = %name, waited_ms = timeout.as_millis() as u64, "Queue wait timed out");
        Err(FetchError::QueueTimeout {
            proxy: name.to_string(),
            waited_ms: timeout.as_millis() as u64,
        })
    }

    fn admit_locked(
        &self,
        slots: &mut SlotMap,
        name: &str,
        candidates: &[Arc<ProxyDescriptor>],
    ) -> Option<SlotGuard> {
        let max = self.inner.max_concurrent();

        let state = slots.entry(name.to_string()).or_default();
        if state.has_capacity(max) {
            state.active += 1;
            return Some(self.guard(name));
        }

        for candidate in candidates.iter().filter(|c| c.name != name) {
            let state = slots.entry(candidate.name.clone()).or_default();
            if state.has_capacity(max) {
                state.active += 1;
                debug!(
                    requested = %name,
                    assigned = %candidate.name,
                    "Proxy saturated, redirecting request"
                );
                return Some(self.guard(&candidate.name));
            }
        }

        None
    }

    fn guard(&self, name: &str) -> SlotGuard {
        SlotGuard {
            pool: self.inner.clone(),
            name: name.to_string(),
        }
    }
}

/// A queued admission request.
///
/// Dropping it while still queued removes it from the queue; dropping it
/// after a grant was delivered passes the slot on.
struct PendingAdmission {
    pool: Arc<PoolInner>,
    name: String,
    id: u64,
    rx: Option<oneshot::Receiver<()>>,
}

impl PendingAdmission {
    /// Leaves the queue. Returns true if a grant arrived first, in which case
    /// the caller owns the slot.
    fn withdraw(&mut self) -> bool {
        let mut slots = self.pool.lock();
        if let Some(state) = slots.get_mut(&self.name) {
            if let Some(pos) = state.queue.iter().position(|w| w.id == self.id) {
                state.queue.remove(pos);
                self.rx = None;
                return false;
            }
        }

        // Grants are sent under the lock, so a missing entry means the grant
        // is already in the channel.
        match self.rx.take() {
            Some(mut rx) => rx.try_recv().is_ok(),
            None => false,
        }
    }
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        if self.rx.is_none() {
            return;
        }
        if self.withdraw() {
            let mut slots = self.pool.lock();
            self.pool.release_locked(&mut slots, &self.name);
        }
    }
}

/// One held slot. Released on drop.
pub struct SlotGuard {
    pool: Arc<PoolInner>,
    name: String,
}

impl SlotGuard {
    /// The proxy this slot belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard").field("name", &self.name).finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slots = self.pool.lock();
        self.pool.release_locked(&mut slots, &self.name);
    }
}
