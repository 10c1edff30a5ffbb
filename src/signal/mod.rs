//! Remote process-variable registers shared with the experiment-control
//! environment.
//!
//! Both register kinds are long-lived external resources: the remote
//! controller owns their true state, this crate only requests changes and
//! observes results.

pub mod flag;
pub mod waveform;

pub use flag::{FlagChannel, FlagState, SubscriptionId};
pub use waveform::WaveformBuffer;
