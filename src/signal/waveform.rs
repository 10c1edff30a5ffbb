//! Remote waveform (append-style array) registers.
//!
//! A [`WaveformBuffer`] mirrors one numeric array register that the remote
//! controller appends to during an acquisition, together with its live
//! populated-element count. From the orchestrating side the buffer is
//! read-only; the `post`/`reset` surface exists for the remote-controller
//! side of the register (simulators and tests).
//!
//! Values may still be changing concurrently with reads: snapshot
//! `element_count()` once and only iterate up to that snapshot to get a
//! consistent view. The populated count is monotonically non-decreasing
//! within one acquisition cycle; the remote controller resets it before the
//! next arm.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::{FlyError, FlyResult};

struct WaveformShared {
    address: String,
    capacity: usize,
    samples: Mutex<Vec<f64>>,
}

/// One remote append-style array register.
///
/// Created at configuration time from a connection string and shared for the
/// process lifetime. Cloning yields another handle to the same register.
#[derive(Clone)]
pub struct WaveformBuffer {
    shared: Arc<WaveformShared>,
}

impl fmt::Debug for WaveformBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaveformBuffer")
            .field("address", &self.shared.address)
            .field("capacity", &self.shared.capacity)
            .field("element_count", &self.element_count())
            .finish()
    }
}

impl WaveformBuffer {
    /// Create a register mirror with the given connection string and maximum
    /// element count.
    pub fn new(address: impl Into<String>, capacity: usize) -> Self {
        Self {
            shared: Arc::new(WaveformShared {
                address: address.into(),
                capacity,
                samples: Mutex::new(Vec::with_capacity(capacity)),
            }),
        }
    }

    /// The configuration-time connection string for this register.
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Maximum number of elements the register can hold.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Current populated-element count.
    pub fn element_count(&self) -> usize {
        self.shared.samples.lock().len()
    }

    /// Read one element, failing with [`FlyError::IndexOutOfRange`] if
    /// `index` is at or past the populated count.
    pub fn value_at(&self, index: usize) -> FlyResult<f64> {
        let samples = self.shared.samples.lock();
        samples
            .get(index)
            .copied()
            .ok_or_else(|| FlyError::IndexOutOfRange {
                address: self.shared.address.clone(),
                index,
                populated: samples.len(),
            })
    }

    /// Copy the populated elements out in one consistent view.
    pub fn snapshot(&self) -> Vec<f64> {
        self.shared.samples.lock().clone()
    }

    /// Remote-controller side: append one sample. A sample past capacity is
    /// dropped, matching the saturating behavior of hardware waveform
    /// records.
    pub fn post(&self, value: f64) {
        let mut samples = self.shared.samples.lock();
        if samples.len() >= self.shared.capacity {
            warn!(
                waveform = %self.shared.address,
                capacity = self.shared.capacity,
                "waveform full; dropping sample"
            );
            return;
        }
        samples.push(value);
        trace!(waveform = %self.shared.address, value, count = samples.len(), "sample posted");
    }

    /// Remote-controller side: clear the register before the next cycle.
    pub fn reset(&self) {
        self.shared.samples.lock().clear();
    }
}
