//! Single-assignment completion futures.
//!
//! A [`CompletionFuture`] is the one synchronization point bridging the
//! remote-register notification thread and the synchronous caller driving
//! the fly-scan protocol: a subscription callback resolves it, the caller
//! blocks on it. It is resolved exactly once — resolving twice is a no-op,
//! never an error, because the notification source may fire multiple times
//! before the watcher is unsubscribed.
//!
//! Each future carries a [`CycleId`]. The [`ActiveCycle`] guard shared
//! between a controller and its subscription callbacks rejects resolutions
//! whose cycle identity is no longer current, so a callback that fires after
//! `abort` (or before the next arm) cannot leak into a later cycle.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{FlyError, FlyResult};

/// Identity of one acquisition cycle, unique per controller lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleId(u64);

impl CycleId {
    /// Sentinel meaning "no cycle in flight"; never assigned to a future.
    const NONE: u64 = 0;

    pub(crate) fn new(id: u64) -> Self {
        debug_assert_ne!(id, Self::NONE);
        Self(id)
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of [`CompletionFuture::wait_blocking`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The future resolved; carries the success flag.
    Resolved(bool),
    /// The timeout elapsed with the future still unresolved.
    TimedOut,
}

/// A thread-safe future resolved at most once, by at most one notification
/// path.
///
/// Designed to be resolved from a notification callback running on a
/// different thread than the one that created it and the one that waits on
/// it. The waiter checks resolution *state*, not the notification event, so
/// a resolution that lands before `wait_blocking` is never missed.
pub struct CompletionFuture {
    id: CycleId,
    state: Mutex<Option<bool>>,
    resolved: Condvar,
}

impl fmt::Debug for CompletionFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionFuture")
            .field("id", &self.id)
            .field("outcome", &*self.state.lock())
            .finish()
    }
}

impl CompletionFuture {
    pub(crate) fn new(id: CycleId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(None),
            resolved: Condvar::new(),
        })
    }

    /// The cycle this future belongs to.
    pub fn id(&self) -> CycleId {
        self.id
    }

    /// Resolve with the given success flag. The first call wins; later calls
    /// are ignored. Returns whether this call performed the resolution.
    pub fn resolve(&self, success: bool) -> bool {
        let mut state = self.state.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(success);
        self.resolved.notify_all();
        true
    }

    /// Whether the future has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.state.lock().is_some()
    }

    /// The success flag, if resolved.
    pub fn outcome(&self) -> Option<bool> {
        *self.state.lock()
    }

    /// Block the calling thread until resolution or timeout, without
    /// busy-polling.
    pub fn wait_blocking(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(success) = *state {
                return WaitOutcome::Resolved(success);
            }
            if self.resolved.wait_until(&mut state, deadline).timed_out() {
                // Re-check: resolution and timeout expiry can race.
                return match *state {
                    Some(success) => WaitOutcome::Resolved(success),
                    None => WaitOutcome::TimedOut,
                };
            }
        }
    }
}

/// Tracks which cycle is currently allowed to resolve.
///
/// Shared between a controller and the subscription callbacks it registers.
/// The controller points it at the live cycle on arm and clears it on abort
/// and drain; a callback resolves through it so a stale notification is
/// detected and discarded instead of leaking into the next cycle.
pub(crate) struct ActiveCycle(AtomicU64);

impl ActiveCycle {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(CycleId::NONE)))
    }

    pub(crate) fn set(&self, id: CycleId) {
        self.0.store(id.0, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.0.store(CycleId::NONE, Ordering::Release);
    }

    /// Resolve `future` only if it still belongs to the current cycle.
    pub(crate) fn resolve_if_current(
        &self,
        future: &CompletionFuture,
        success: bool,
    ) -> FlyResult<()> {
        if self.0.load(Ordering::Acquire) != future.id.0 {
            return Err(FlyError::StaleResolution(future.id));
        }
        future.resolve(success);
        Ok(())
    }
}
