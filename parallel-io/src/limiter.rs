use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

/// Default memory budget of a writer without a shared limiter (2 GiB).
pub const DEFAULT_RAM_LIMIT: usize = 2 * 1_024 * 1_024 * 1_024;

/// How a reservation waits for room in a [`ResourceLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockType {
    /// Wait until `outstanding + amount <= capacity`.
    ///
    /// Meant for submitters reserving room before scheduling work: the submitting task is suspended, no worker is held.
    #[default]
    Soft,
    /// Wait until the limiter is no longer over-committed, then grant even if the grant exceeds the capacity.
    ///
    /// Meant for nested reservations taken by a job that already holds a soft guard. Such a job parks its worker while waiting,
    /// and hard grants only ever wait for other hard grants to drain, so nested reservations cannot starve the pool.
    Hard,
}

#[derive(Debug, Default)]
struct LimiterState {
    outstanding: usize,
    peak: usize,
}

/// A thread-safe memory budget shared by any number of writers.
///
/// Reservations are handed out as [`ResourceGuard`]s releasing their amount on drop.
///
/// ```
/// # tokio_test::block_on(async {
/// # use std::sync::Arc;
/// # use parallel_io::{LockType, ResourceLimiter};
/// let limiter = Arc::new(ResourceLimiter::new(10, "docs"));
///
/// let guard = limiter.acquire(6, LockType::Soft).await;
/// assert_eq!(limiter.outstanding(), 6);
/// assert!(limiter.try_acquire(6).is_none());
///
/// drop(guard);
/// assert_eq!(limiter.outstanding(), 0);
/// # })
/// ```
#[derive(Debug)]
pub struct ResourceLimiter {
    name: String,
    capacity: usize,
    state: Mutex<LimiterState>,
    released: Notify,
}

impl ResourceLimiter {
    pub fn new(capacity: usize, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity,
            state: Mutex::default(),
            released: Notify::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Currently reserved amount.
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Highest reserved amount observed so far.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    /// Reserve `amount` without waiting, following the [`LockType::Soft`] rule.
    pub fn try_acquire(self: &Arc<Self>, amount: usize) -> Option<ResourceGuard> {
        self.try_grant(amount, LockType::Soft)
    }

    /// Reserve `amount`, waiting for room as dictated by `lock_type`. An empty reservation never waits.
    ///
    /// Waiters are not served in arrival order: a large reservation may keep waiting while smaller ones still fit.
    ///
    /// # Panics
    /// This method panics if a soft reservation asks for more than the whole capacity, since it could never be granted.
    pub async fn acquire(self: &Arc<Self>, amount: usize, lock_type: LockType) -> ResourceGuard {
        assert!(
            lock_type == LockType::Hard || amount <= self.capacity,
            "soft reservation of {amount} bytes exceeds limiter `{}` capacity of {} bytes",
            self.name,
            self.capacity
        );

        loop {
            // register interest before checking, so a release in between is not missed
            let mut released = pin!(self.released.notified());
            released.as_mut().enable();

            if let Some(guard) = self.try_grant(amount, lock_type) {
                return guard;
            }

            tracing::trace!("Waiting for {amount} bytes from limiter `{}` ({lock_type:?})...", self.name);

            released.await;
        }
    }

    fn try_grant(self: &Arc<Self>, amount: usize, lock_type: LockType) -> Option<ResourceGuard> {
        let mut state = self.lock();

        let admitted = match lock_type {
            _ if amount == 0 => true,
            LockType::Soft => state.outstanding.checked_add(amount).is_some_and(|total| total <= self.capacity),
            LockType::Hard => state.outstanding <= self.capacity,
        };

        admitted.then(|| {
            state.outstanding += amount;
            state.peak = state.peak.max(state.outstanding);

            ResourceGuard {
                limiter: Arc::clone(self),
                amount,
            }
        })
    }

    fn release(&self, amount: usize) {
        let mut state = self.lock();
        debug_assert!(state.outstanding >= amount);
        state.outstanding -= amount;
        drop(state);

        self.released.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        // counters stay consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A reservation held against a [`ResourceLimiter`].
///
/// The reserved amount is released exactly once, when the guard is dropped.
#[must_use = "the reservation is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ResourceGuard {
    limiter: Arc<ResourceLimiter>,
    amount: usize,
}

impl ResourceGuard {
    #[inline]
    pub fn amount(&self) -> usize {
        self.amount
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if self.amount > 0 {
            self.limiter.release(self.amount);
        }
    }
}
