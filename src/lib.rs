//! Fly-scan acquisition coordination.
//!
//! An external controller autonomously performs a timed or triggered
//! motion/acquisition sequence; this crate only arms it over a remote busy
//! flag, waits for the asynchronous completion signal, then drains the
//! buffered waveform results into an ordered, timestamped record stream
//! for a recording sink.

pub mod config;
pub mod document;
pub mod error;
pub mod flyer;
pub mod signal;

pub use error::{FlyError, FlyResult};
