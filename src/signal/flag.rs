//! Remote busy-flag registers.
//!
//! A [`FlagChannel`] mirrors one boolean-like state register that a remote
//! controller flips to signal start/done of an operation. The orchestrating
//! side only ever *requests* a change — a write is sent fire-and-forget and
//! the remote controller decides when (and whether) the value actually
//! transitions. Change notifications are pushed to subscribers with the
//! old/new value payload, on a notification thread distinct from any caller.
//!
//! # Thread Safety
//!
//! Handles are cheap clones sharing one register. Callbacks run on the
//! channel's dedicated notification thread; they must be fast and
//! non-blocking, and must never be assumed to run on the writing thread.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// The closed set of states a remote flag register can take.
///
/// The remote controller owns the "true" state; this side only observes it
/// and requests transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagState {
    /// Register is idle; no operation requested.
    Idle,
    /// An operation is in progress on the remote side.
    Busy,
    /// The remote side finished the requested operation.
    Done,
}

impl fmt::Display for FlagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagState::Idle => write!(f, "idle"),
            FlagState::Busy => write!(f, "busy"),
            FlagState::Done => write!(f, "done"),
        }
    }
}

/// Handle returned by [`FlagChannel::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type FlagCallback = Arc<dyn Fn(FlagState, FlagState) + Send + Sync>;

struct FlagChange {
    old: FlagState,
    new: FlagState,
}

struct FlagShared {
    address: String,
    value: Mutex<FlagState>,
    subscribers: Mutex<HashMap<u64, FlagCallback>>,
    next_subscription: AtomicU64,
    notify_tx: mpsc::Sender<FlagChange>,
}

/// One remote boolean/state register ("busy" flag).
///
/// Created at configuration time from a connection string and shared for the
/// process lifetime. Cloning yields another handle to the same register.
#[derive(Clone)]
pub struct FlagChannel {
    shared: Arc<FlagShared>,
}

impl fmt::Debug for FlagChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagChannel")
            .field("address", &self.shared.address)
            .field("value", &self.read())
            .finish()
    }
}

impl FlagChannel {
    /// Create a register mirror for the given connection string, initially
    /// [`FlagState::Idle`].
    pub fn new(address: impl Into<String>) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel();
        let shared = Arc::new(FlagShared {
            address: address.into(),
            value: Mutex::new(FlagState::Idle),
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            notify_tx,
        });
        let weak = Arc::downgrade(&shared);
        thread::spawn(move || notification_loop(notify_rx, weak));
        Self { shared }
    }

    /// The configuration-time connection string for this register.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Synchronously read the last observed value.
    pub fn read(&self) -> FlagState {
        *self.shared.value.lock()
    }

    /// Request a state change. Fire-and-forget: the write does not block for
    /// confirmation, and a lost write is a silent no-op at this layer —
    /// detection is the caller's responsibility via timeout.
    ///
    /// Subscribers are notified only on an observed value change.
    pub fn write(&self, state: FlagState) {
        let old = {
            let mut value = self.shared.value.lock();
            let old = *value;
            if old == state {
                return;
            }
            *value = state;
            old
        };
        trace!(channel = %self.shared.address, %old, new = %state, "flag transition");
        // The dispatcher outlives every handle; a send can only fail during
        // teardown, where dropping the notification is the correct outcome.
        let _ = self.shared.notify_tx.send(FlagChange { old, new: state });
    }

    /// Register a callback invoked with `(old, new)` on every observed value
    /// change, on the channel's notification thread.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(FlagState, FlagState) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers
            .lock()
            .insert(id, Arc::new(callback));
        SubscriptionId(id)
    }

    /// Remove a callback registered with [`subscribe`](Self::subscribe).
    ///
    /// Notifications already queued on the notification thread may still be
    /// delivered to the callback after this returns.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.subscribers.lock().remove(&id.0);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }
}

fn notification_loop(rx: mpsc::Receiver<FlagChange>, shared: Weak<FlagShared>) {
    while let Ok(change) = rx.recv() {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        // Snapshot the registry so callbacks run without holding the lock;
        // a callback may subscribe or unsubscribe from within.
        let callbacks: Vec<FlagCallback> = shared.subscribers.lock().values().cloned().collect();
        for callback in callbacks {
            callback(change.old, change.new);
        }
    }
}
