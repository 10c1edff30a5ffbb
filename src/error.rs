//! Custom error types for the crate.
//!
//! This module defines the primary error type, `FlyError`, for the whole
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of the fly-scan protocol,
//! from state-machine misuse to remote-register problems.
//!
//! ## Error Hierarchy
//!
//! `FlyError` is an enum that consolidates the protocol's taxonomy:
//!
//! - **`AlreadyArmed`**, **`NotArmed`**, **`NotCompleted`**: state-machine
//!   misuse. These are programmer errors, surfaced immediately and never
//!   retried internally.
//! - **`Timeout`** / **`PhaseTimeout`**: a completion signal did not arrive
//!   within the configured bound. Recoverable — the caller decides whether
//!   to extend the wait or abort the cycle.
//! - **`IndexOutOfRange`**: a waveform read past the populated length.
//! - **`StaleResolution`**: a completion callback fired for a cycle that is
//!   no longer current (after `abort`, or before the next `arm`). Detected
//!   by comparing the callback's captured cycle identity against the
//!   controller's current one, and discarded.
//! - **`Config`**: wraps errors from the `config` crate, typically file
//!   parsing or format issues.
//! - **`Configuration`**: semantic errors in the configuration — values
//!   that parse fine but are logically wrong (duplicate channel names, a
//!   time channel that names no configured channel). Caught during the
//!   validation step.
//!
//! By using `#[from]`, `FlyError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the crate with the
//! `?` operator.

use std::time::Duration;

use thiserror::Error;

use crate::flyer::completion::CycleId;

/// Convenience alias for results using the crate error type.
pub type FlyResult<T> = std::result::Result<T, FlyError>;

/// Failure modes of the fly-scan protocol.
#[derive(Error, Debug)]
pub enum FlyError {
    #[error("flyer is already armed; one acquisition cycle at a time")]
    AlreadyArmed,

    #[error("no acquisition cycle in flight")]
    NotArmed,

    #[error("acquisition cycle has not completed")]
    NotCompleted,

    #[error("timed out after {0:?} waiting for completion")]
    Timeout(Duration),

    #[error("phase '{phase}' did not complete within {timeout:?}")]
    PhaseTimeout { phase: String, timeout: Duration },

    #[error("index {index} out of range for waveform '{address}' ({populated} populated)")]
    IndexOutOfRange {
        address: String,
        index: usize,
        populated: usize,
    },

    #[error("completion for cycle {0} is stale and was discarded")]
    StaleResolution(CycleId),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("configuration validation error: {0}")]
    Configuration(String),
}
