//! Two-stage taxi/fly sequencing.
//!
//! Some controllers split an acquisition into a preparatory "taxi" motion
//! that must finish before the main "fly" operation starts. The
//! [`TaxiFlyOrchestrator`] sequences the two flags, blocking at each phase
//! boundary until the phase's done sentinel is observed. No data is
//! collected here — this component exists purely to gate a downstream
//! data-collection step (for example a
//! [`FlyerController`](super::FlyerController)) behind two sequential
//! external operations.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{FlyError, FlyResult};
use crate::signal::{FlagChannel, FlagState};

use super::completion::{ActiveCycle, CompletionFuture, CycleId, WaitOutcome};
use super::watch_for_done;

/// One externally-controlled phase: a flag channel with its own sentinels
/// and completion bound.
#[derive(Clone, Debug)]
pub struct FlightPhase {
    name: String,
    channel: FlagChannel,
    start_sentinel: FlagState,
    done_sentinel: FlagState,
    timeout: Duration,
}

impl FlightPhase {
    /// Create a phase with default sentinels ([`FlagState::Busy`] to start,
    /// [`FlagState::Done`] when finished).
    pub fn new(name: impl Into<String>, channel: FlagChannel, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            channel,
            start_sentinel: FlagState::Busy,
            done_sentinel: FlagState::Done,
            timeout,
        }
    }

    /// Override the start/done sentinel values for this phase's flag.
    pub fn with_sentinels(mut self, start: FlagState, done: FlagState) -> Self {
        self.start_sentinel = start;
        self.done_sentinel = done;
        self
    }

    /// Phase name, used in [`FlyError::PhaseTimeout`] and diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The flag register this phase is sequenced over.
    pub fn channel(&self) -> &FlagChannel {
        &self.channel
    }
}

/// Sequences a taxi phase and a fly phase, each awaited to completion
/// before proceeding.
pub struct TaxiFlyOrchestrator {
    taxi: FlightPhase,
    fly: FlightPhase,
    next_cycle: u64,
    active: Arc<ActiveCycle>,
}

impl TaxiFlyOrchestrator {
    /// Create an orchestrator over the two phase flags.
    pub fn new(taxi: FlightPhase, fly: FlightPhase) -> Self {
        Self {
            taxi,
            fly,
            next_cycle: 0,
            active: ActiveCycle::new(),
        }
    }

    /// The preparatory phase.
    pub fn taxi(&self) -> &FlightPhase {
        &self.taxi
    }

    /// The main phase.
    pub fn fly(&self) -> &FlightPhase {
        &self.fly
    }

    /// Run taxi then fly: write each phase's start sentinel and block until
    /// its done sentinel is observed, in order. The fly phase is not started
    /// until the taxi phase has completed.
    ///
    /// Fails with [`FlyError::PhaseTimeout`] naming the phase that did not
    /// complete within its bound; the other phase is left untouched.
    pub fn run_phases(&mut self) -> FlyResult<()> {
        self.next_cycle += 1;
        await_phase(&self.taxi, CycleId::new(self.next_cycle), &self.active)?;
        self.next_cycle += 1;
        await_phase(&self.fly, CycleId::new(self.next_cycle), &self.active)
    }
}

/// Arm one phase flag and block until its done sentinel, identical to the
/// flyer's watcher mechanism but with no data-collection phase.
fn await_phase(phase: &FlightPhase, cycle: CycleId, active: &Arc<ActiveCycle>) -> FlyResult<()> {
    let future = CompletionFuture::new(cycle);
    active.set(cycle);
    let watcher = watch_for_done(
        &phase.channel,
        phase.done_sentinel,
        Arc::clone(&future),
        Arc::clone(active),
    );
    phase.channel.write(phase.start_sentinel);
    debug!(phase = %phase.name, %cycle, flag = %phase.channel.address(), "phase started");

    let outcome = future.wait_blocking(phase.timeout);
    phase.channel.unsubscribe(watcher);
    active.clear();
    match outcome {
        WaitOutcome::Resolved(_) => {
            debug!(phase = %phase.name, %cycle, "phase complete");
            Ok(())
        }
        WaitOutcome::TimedOut => {
            warn!(phase = %phase.name, %cycle, timeout = ?phase.timeout, "phase timed out");
            Err(FlyError::PhaseTimeout {
                phase: phase.name.clone(),
                timeout: phase.timeout,
            })
        }
    }
}
