//! Fly-scan coordination (the Flyer protocol).
//!
//! A fly scan delegates motion and triggering to an external controller;
//! this side only arms a busy flag, waits for the asynchronous completion
//! signal, then drains the buffered results. The protocol is a four-phase
//! contract driven by one synchronous caller thread, in strict order once
//! per acquisition cycle:
//!
//! ```text
//! arm() ──> wait() ──> schema() ──> drain()
//!  Idle      Armed      (pure)      Completed ──> Idle
//! ```
//!
//! [`controller::FlyerController`] implements the full contract;
//! [`taxi::TaxiFlyOrchestrator`] is the two-stage prepare/run variant with
//! no data-collection phase.

pub mod completion;
pub mod controller;
pub mod taxi;

pub use completion::{CompletionFuture, CycleId, WaitOutcome};
pub use controller::{DataChannel, FlyRecord, FlyerController, FlyerState, RecordDrain, TimestampMode};
pub use taxi::{FlightPhase, TaxiFlyOrchestrator};

use std::sync::Arc;

use tracing::warn;

use crate::signal::{FlagChannel, FlagState, SubscriptionId};
use completion::ActiveCycle;

/// Subscribe a watcher that resolves `future` with success once `channel`
/// reaches `done` — and only while the cycle identity is still current.
///
/// The callback runs on the channel's notification thread and does nothing
/// heavier than the resolution; a stale firing is discarded with a warning.
pub(crate) fn watch_for_done(
    channel: &FlagChannel,
    done: FlagState,
    future: Arc<CompletionFuture>,
    active: Arc<ActiveCycle>,
) -> SubscriptionId {
    let address = channel.address().to_string();
    channel.subscribe(move |_old, new| {
        if new != done {
            return;
        }
        if let Err(err) = active.resolve_if_current(&future, true) {
            warn!(channel = %address, %err, "discarding stale completion");
        }
    })
}
