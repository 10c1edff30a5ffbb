//! The Flyer state machine.
//!
//! [`FlyerController`] arms a remote busy flag, attaches a completion
//! watcher, exposes a wait-handle, and drains waveform buffers into an
//! ordered sequence of timestamped records once waiting finishes.
//!
//! # State Machine
//!
//! ```text
//! Idle ──arm()──> Armed ──wait()──> Completed ──drain()──> Idle
//!   ^                                                        │
//!   └────────────────────── abort() ─────────────────────────┘
//! ```
//!
//! One synchronous caller thread drives the transitions; the completion
//! watcher runs on the flag channel's notification thread and only ever
//! resolves the cycle's [`CompletionFuture`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::document::{epoch_seconds, DataKey};
use crate::error::{FlyError, FlyResult};
use crate::signal::{FlagChannel, FlagState, SubscriptionId, WaveformBuffer};

use super::completion::{ActiveCycle, CompletionFuture, CycleId, WaitOutcome};
use super::watch_for_done;

/// Lifecycle state of a [`FlyerController`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlyerState {
    /// No acquisition cycle in flight.
    Idle,
    /// Trigger written, watcher subscribed, completion future live.
    Armed,
    /// The completion future resolved; results not yet drained.
    Completed,
}

/// How per-record timestamps are reported when a time channel is configured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampMode {
    /// Report the time-channel sample as-is (epoch seconds).
    #[default]
    Absolute,
    /// Subtract the arm-time reference from the time-channel sample.
    RelativeToStart,
}

/// One named data channel: a waveform register and the name it is published
/// under in schema and records.
#[derive(Clone, Debug)]
pub struct DataChannel {
    name: String,
    buffer: WaveformBuffer,
    units: String,
}

impl DataChannel {
    /// Bind `buffer` to the record/schema key `name`.
    pub fn new(name: impl Into<String>, buffer: WaveformBuffer) -> Self {
        Self {
            name: name.into(),
            buffer,
            units: String::new(),
        }
    }

    /// Physical units announced in the schema.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    /// The record/schema key for this channel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The waveform register backing this channel.
    pub fn buffer(&self) -> &WaveformBuffer {
        &self.buffer
    }
}

/// One drained record: a wall-clock emission timestamp, a data mapping and a
/// parallel timestamp mapping keyed by the same channel names.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlyRecord {
    /// Wall-clock time at which this record was produced.
    pub time: DateTime<Utc>,
    /// Channel name → value at this record's index.
    pub data: HashMap<String, f64>,
    /// Channel name → associated timestamp (seconds; absolute or
    /// start-relative per the configured convention).
    pub timestamps: HashMap<String, f64>,
}

/// Coordinates one remote-triggered acquisition at a time.
///
/// Owns its [`CompletionFuture`]; references (does not own) the trigger flag
/// and the waveform buffers, which are long-lived resources shared with the
/// rest of the experiment-control environment.
pub struct FlyerController {
    name: String,
    trigger: FlagChannel,
    channels: Vec<DataChannel>,
    time_channel: Option<String>,
    timestamp_mode: TimestampMode,
    start_sentinel: FlagState,
    done_sentinel: FlagState,
    state: FlyerState,
    next_cycle: u64,
    active: Arc<ActiveCycle>,
    current: Option<Arc<CompletionFuture>>,
    watcher: Option<SubscriptionId>,
    armed_at: Option<DateTime<Utc>>,
}

impl FlyerController {
    /// Create a controller over `trigger` and the given data channels.
    ///
    /// Defaults: start sentinel [`FlagState::Busy`], done sentinel
    /// [`FlagState::Done`], no time channel, absolute timestamps.
    pub fn new(
        name: impl Into<String>,
        trigger: FlagChannel,
        channels: Vec<DataChannel>,
    ) -> Self {
        Self {
            name: name.into(),
            trigger,
            channels,
            time_channel: None,
            timestamp_mode: TimestampMode::default(),
            start_sentinel: FlagState::Busy,
            done_sentinel: FlagState::Done,
            state: FlyerState::Idle,
            next_cycle: 0,
            active: ActiveCycle::new(),
            current: None,
            watcher: None,
            armed_at: None,
        }
    }

    /// Designate one channel as the source of per-record timestamps.
    pub fn with_time_channel(mut self, name: impl Into<String>) -> Self {
        self.time_channel = Some(name.into());
        self
    }

    /// Select the timestamp reporting convention.
    pub fn with_timestamp_mode(mut self, mode: TimestampMode) -> Self {
        self.timestamp_mode = mode;
        self
    }

    /// Override the start/done sentinel values written to and watched on the
    /// trigger flag.
    pub fn with_sentinels(mut self, start: FlagState, done: FlagState) -> Self {
        self.start_sentinel = start;
        self.done_sentinel = done;
        self
    }

    /// Controller name, used for run documents and diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FlyerState {
        self.state
    }

    /// The trigger flag register.
    pub fn trigger(&self) -> &FlagChannel {
        &self.trigger
    }

    /// The configured data channels, in schema/record order.
    pub fn channels(&self) -> &[DataChannel] {
        &self.channels
    }

    /// The in-flight cycle's wait-handle, if any.
    pub fn wait_handle(&self) -> Option<Arc<CompletionFuture>> {
        self.current.clone()
    }

    /// Start an acquisition cycle: create the completion future, capture the
    /// start-time reference, attach the watcher, then request the start
    /// sentinel on the trigger flag. Non-blocking.
    ///
    /// Fails with [`FlyError::AlreadyArmed`] if a cycle is already in
    /// flight; it never silently replaces one.
    pub fn arm(&mut self) -> FlyResult<()> {
        if self.state != FlyerState::Idle {
            return Err(FlyError::AlreadyArmed);
        }

        self.next_cycle += 1;
        let cycle = CycleId::new(self.next_cycle);
        let future = CompletionFuture::new(cycle);
        self.active.set(cycle);
        self.armed_at = Some(Utc::now());

        // Subscribe before writing the start sentinel so a controller that
        // finishes instantly cannot signal done unobserved.
        self.watcher = Some(watch_for_done(
            &self.trigger,
            self.done_sentinel,
            Arc::clone(&future),
            Arc::clone(&self.active),
        ));
        self.current = Some(future);
        self.trigger.write(self.start_sentinel);
        self.state = FlyerState::Armed;
        debug!(flyer = %self.name, %cycle, trigger = %self.trigger.address(), "armed");
        Ok(())
    }

    /// Block until the in-flight cycle completes or `timeout` elapses.
    ///
    /// A timeout leaves the controller `Armed` so the caller may wait again
    /// or [`abort`](Self::abort). Resolution state, not the notification
    /// event, is what this checks first — a completion that signalled before
    /// `wait` was called is still observed. Calling after completion is a
    /// no-op.
    pub fn wait(&mut self, timeout: Duration) -> FlyResult<()> {
        match self.state {
            FlyerState::Idle => Err(FlyError::NotArmed),
            FlyerState::Completed => Ok(()),
            FlyerState::Armed => {
                let future = self.current.clone().ok_or(FlyError::NotArmed)?;
                match future.wait_blocking(timeout) {
                    WaitOutcome::TimedOut => {
                        warn!(flyer = %self.name, cycle = %future.id(), ?timeout, "wait timed out");
                        Err(FlyError::Timeout(timeout))
                    }
                    WaitOutcome::Resolved(success) => {
                        if let Some(id) = self.watcher.take() {
                            self.trigger.unsubscribe(id);
                        }
                        self.state = FlyerState::Completed;
                        debug!(flyer = %self.name, cycle = %future.id(), success, "cycle completed");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Force the controller back to `Idle`, unsubscribing the watcher and
    /// invalidating the cycle identity so a late completion callback is
    /// detected and discarded rather than leaking into the next cycle.
    pub fn abort(&mut self) {
        if let Some(id) = self.watcher.take() {
            self.trigger.unsubscribe(id);
        }
        self.active.clear();
        if let Some(future) = self.current.take() {
            future.resolve(false);
            info!(flyer = %self.name, cycle = %future.id(), "cycle aborted");
        }
        self.armed_at = None;
        self.state = FlyerState::Idle;
    }

    /// Describe the data channels: source address, numeric dtype, and shape
    /// `(1,)` (scalar per record), keyed by channel name.
    ///
    /// Pure; valid in any state. The key set is stable across calls and
    /// identical to the key set of every drained record.
    pub fn schema(&self) -> HashMap<String, DataKey> {
        self.channels
            .iter()
            .map(|ch| {
                let key = DataKey::number(ch.buffer.address()).with_units(&ch.units);
                (ch.name.clone(), key)
            })
            .collect()
    }

    /// Convert the completed cycle's buffered samples into a lazy, finite,
    /// non-restartable record sequence.
    ///
    /// Populated counts are snapshotted once, here; records cover indices up
    /// to the minimum count across buffers (counts may differ slightly when
    /// the remote side is still flushing — an accepted weak-consistency
    /// tradeoff, logged when observed). The cycle is consumed eagerly: the
    /// controller returns to `Idle` and the iterator owns the snapshot, so
    /// overlapping drains cannot exist.
    pub fn drain(&mut self) -> FlyResult<RecordDrain> {
        if self.state != FlyerState::Completed {
            return Err(FlyError::NotCompleted);
        }

        let counts: Vec<usize> = self
            .channels
            .iter()
            .map(|ch| ch.buffer.element_count())
            .collect();
        let limit = counts.iter().copied().min().unwrap_or(0);
        if counts.iter().any(|&count| count != limit) {
            warn!(flyer = %self.name, ?counts, limit, "buffer counts diverged; truncating to minimum");
        }

        let series: Vec<(String, Vec<f64>)> = self
            .channels
            .iter()
            .map(|ch| {
                let mut values = ch.buffer.snapshot();
                values.truncate(limit);
                (ch.name.clone(), values)
            })
            .collect();
        let time_index = self
            .time_channel
            .as_deref()
            .and_then(|time| series.iter().position(|(name, _)| name == time));
        let start_epoch = self.armed_at.map(epoch_seconds).unwrap_or_default();

        info!(flyer = %self.name, records = limit, "draining cycle");
        self.current = None;
        self.active.clear();
        self.armed_at = None;
        self.state = FlyerState::Idle;

        Ok(RecordDrain {
            series,
            time_index,
            mode: self.timestamp_mode,
            start_epoch,
            index: 0,
            limit,
        })
    }
}

/// Lazy record sequence produced by [`FlyerController::drain`].
///
/// Finite and non-restartable: it owns the snapshot taken at drain time and
/// can only be obtained once per completed cycle.
pub struct RecordDrain {
    series: Vec<(String, Vec<f64>)>,
    time_index: Option<usize>,
    mode: TimestampMode,
    start_epoch: f64,
    index: usize,
    limit: usize,
}

impl Iterator for RecordDrain {
    type Item = FlyRecord;

    fn next(&mut self) -> Option<FlyRecord> {
        if self.index >= self.limit {
            return None;
        }
        let i = self.index;
        self.index += 1;

        let now = Utc::now();
        let stamp = match self.time_index {
            Some(t) => {
                let sample = self.series[t].1[i];
                match self.mode {
                    TimestampMode::Absolute => sample,
                    TimestampMode::RelativeToStart => sample - self.start_epoch,
                }
            }
            // No time channel configured: stamp with the emission time.
            None => epoch_seconds(now),
        };

        let mut data = HashMap::with_capacity(self.series.len());
        let mut timestamps = HashMap::with_capacity(self.series.len());
        for (name, values) in &self.series {
            data.insert(name.clone(), values[i]);
            timestamps.insert(name.clone(), stamp);
        }
        Some(FlyRecord {
            time: now,
            data,
            timestamps,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.limit - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RecordDrain {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn test_flyer() -> (FlyerController, FlagChannel, Vec<WaveformBuffer>) {
        let trigger = FlagChannel::new("prj:mybusy");
        let buffers = vec![
            WaveformBuffer::new("prj:x_array", 256),
            WaveformBuffer::new("prj:y_array", 256),
            WaveformBuffer::new("prj:t_array", 256),
        ];
        let channels = vec![
            DataChannel::new("x", buffers[0].clone()).with_units("mm"),
            DataChannel::new("y", buffers[1].clone()),
            DataChannel::new("t", buffers[2].clone()).with_units("s"),
        ];
        let flyer = FlyerController::new("flyer", trigger.clone(), channels)
            .with_time_channel("t");
        (flyer, trigger, buffers)
    }

    #[test]
    fn test_arm_twice_fails_and_leaves_first_cycle_untouched() {
        let (mut flyer, _trigger, _buffers) = test_flyer();
        flyer.arm().unwrap();
        let first = flyer.wait_handle().unwrap();

        assert!(matches!(flyer.arm(), Err(FlyError::AlreadyArmed)));
        assert_eq!(flyer.state(), FlyerState::Armed);
        assert!(!first.is_resolved());
        assert_eq!(flyer.wait_handle().unwrap().id(), first.id());
    }

    #[test]
    fn test_wait_without_cycle_in_flight() {
        let (mut flyer, _trigger, _buffers) = test_flyer();
        assert!(matches!(
            flyer.wait(Duration::from_millis(10)),
            Err(FlyError::NotArmed)
        ));
    }

    #[test]
    fn test_drain_before_completion() {
        let (mut flyer, _trigger, _buffers) = test_flyer();
        assert!(matches!(flyer.drain(), Err(FlyError::NotCompleted)));

        flyer.arm().unwrap();
        assert!(matches!(flyer.drain(), Err(FlyError::NotCompleted)));
    }

    #[test]
    fn test_timeout_leaves_controller_armed() {
        let (mut flyer, trigger, _buffers) = test_flyer();
        flyer.arm().unwrap();

        assert!(matches!(
            flyer.wait(Duration::from_millis(20)),
            Err(FlyError::Timeout(_))
        ));
        assert_eq!(flyer.state(), FlyerState::Armed);

        // The remote side finishes late; a second wait succeeds.
        trigger.write(FlagState::Done);
        flyer.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(flyer.state(), FlyerState::Completed);
    }

    #[test]
    fn test_done_before_wait_is_observed() {
        let (mut flyer, trigger, _buffers) = test_flyer();
        flyer.arm().unwrap();
        trigger.write(FlagState::Done);

        // Give the notification thread time to resolve before waiting.
        let handle = flyer.wait_handle().unwrap();
        while !handle.is_resolved() {
            thread::sleep(Duration::from_millis(1));
        }
        flyer.wait(Duration::from_millis(1)).unwrap();
        assert_eq!(flyer.state(), FlyerState::Completed);
    }

    #[test]
    fn test_drain_truncates_to_minimum_count() {
        let (mut flyer, trigger, buffers) = test_flyer();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            buffers[0].post(v);
            buffers[1].post(v * 10.0);
        }
        for v in [0.1, 0.2, 0.3] {
            buffers[2].post(v);
        }

        flyer.arm().unwrap();
        trigger.write(FlagState::Done);
        flyer.wait(Duration::from_secs(2)).unwrap();

        let records: Vec<FlyRecord> = flyer.drain().unwrap().collect();
        assert_eq!(records.len(), 3);
        for record in &records {
            assert_eq!(record.data.len(), 3);
            assert!(record.data.contains_key("x"));
            assert!(record.data.contains_key("y"));
            assert!(record.data.contains_key("t"));
        }
        assert_eq!(records[2].data["x"], 3.0);
        assert_eq!(records[2].data["y"], 30.0);
    }

    #[test]
    fn test_drain_consumes_cycle() {
        let (mut flyer, trigger, buffers) = test_flyer();
        buffers[0].post(1.0);
        buffers[1].post(2.0);
        buffers[2].post(0.5);

        flyer.arm().unwrap();
        trigger.write(FlagState::Done);
        flyer.wait(Duration::from_secs(2)).unwrap();

        let drain = flyer.drain().unwrap();
        assert_eq!(flyer.state(), FlyerState::Idle);
        assert!(flyer.wait_handle().is_none());
        assert_eq!(drain.count(), 1);

        assert!(matches!(flyer.drain(), Err(FlyError::NotCompleted)));
        assert!(matches!(
            flyer.wait(Duration::from_millis(10)),
            Err(FlyError::NotArmed)
        ));
    }

    #[test]
    fn test_schema_shape_and_sources() {
        let (flyer, _trigger, _buffers) = test_flyer();
        let schema = flyer.schema();
        assert_eq!(schema.len(), 3);

        let x = &schema["x"];
        assert_eq!(x.source, "prj:x_array");
        assert_eq!(x.dtype, "number");
        assert_eq!(x.shape, vec![1]);
        assert_eq!(x.units, "mm");
        assert_eq!(schema["y"].units, "");
    }

    #[test]
    fn test_relative_timestamps() {
        let trigger = FlagChannel::new("prj:mybusy");
        let t_buf = WaveformBuffer::new("prj:t_array", 16);
        let x_buf = WaveformBuffer::new("prj:x_array", 16);
        let mut flyer = FlyerController::new(
            "flyer",
            trigger.clone(),
            vec![
                DataChannel::new("t", t_buf.clone()),
                DataChannel::new("x", x_buf.clone()),
            ],
        )
        .with_time_channel("t")
        .with_timestamp_mode(TimestampMode::RelativeToStart);

        flyer.arm().unwrap();
        let t0 = epoch_seconds(Utc::now());
        t_buf.post(t0 + 0.018);
        x_buf.post(-1.23);
        trigger.write(FlagState::Done);
        flyer.wait(Duration::from_secs(2)).unwrap();

        let records: Vec<FlyRecord> = flyer.drain().unwrap().collect();
        assert_eq!(records.len(), 1);
        // Relative to arm time, so small and positive-ish (arm happened
        // just before t0 was sampled).
        assert!(records[0].timestamps["t"].abs() < 1.0);
        assert_eq!(records[0].timestamps["t"], records[0].timestamps["x"]);
    }

    #[test]
    fn test_custom_sentinels() {
        // A busy-record style trigger returns to idle when finished,
        // rather than reporting a distinct done state.
        let trigger = FlagChannel::new("prj:mybusy");
        let buffer = WaveformBuffer::new("prj:x_array", 16);
        let mut flyer = FlyerController::new(
            "flyer",
            trigger.clone(),
            vec![DataChannel::new("x", buffer.clone())],
        )
        .with_sentinels(FlagState::Busy, FlagState::Idle);

        flyer.arm().unwrap();
        assert_eq!(trigger.read(), FlagState::Busy);
        buffer.post(2.97);
        trigger.write(FlagState::Idle);
        flyer.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(flyer.drain().unwrap().count(), 1);
    }

    #[test]
    fn test_abort_discards_late_completion() {
        let (mut flyer, trigger, _buffers) = test_flyer();
        flyer.arm().unwrap();
        let aborted = flyer.wait_handle().unwrap();
        flyer.abort();
        assert_eq!(flyer.state(), FlyerState::Idle);
        assert_eq!(aborted.outcome(), Some(false));

        // The remote controller signals done anyway; nothing may leak into
        // the next cycle.
        trigger.write(FlagState::Done);
        thread::sleep(Duration::from_millis(50));

        flyer.arm().unwrap();
        let fresh = flyer.wait_handle().unwrap();
        assert!(!fresh.is_resolved());
        flyer.abort();
    }
}
