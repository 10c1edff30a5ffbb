//! Configuration loading and validation.
//!
//! Settings come from a TOML file with environment-variable overrides
//! (prefix `FLYSCAN`). Parsing errors surface as [`FlyError::Config`];
//! values that parse but are logically wrong (duplicate channel names, a
//! time channel that names no configured channel) are caught by the
//! validation step and surface as [`FlyError::Configuration`].
//!
//! The settings are also the composition root: [`Settings::build_flyer`]
//! and [`Settings::build_orchestrator`] construct fully wired controllers
//! with their register collaborators injected — there are no process-wide
//! instances.
//!
//! # Example
//!
//! ```toml
//! [flyer]
//! trigger = "prj:mybusy"
//! time_channel = "t"
//! timestamps = "absolute"
//! wait_timeout = "30s"
//!
//! [[flyer.channels]]
//! name = "x"
//! address = "prj:x_array"
//! capacity = 256
//! units = "mm"
//!
//! [taxi_fly]
//! taxi = { flag = "prj:taxi", timeout = "10s" }
//! fly = { flag = "prj:fly", timeout = "60s" }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{FlyError, FlyResult};
use crate::flyer::{
    DataChannel, FlightPhase, FlyerController, TaxiFlyOrchestrator, TimestampMode,
};
use crate::signal::{FlagChannel, WaveformBuffer};

fn default_flyer_name() -> String {
    "flyer".to_string()
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_capacity() -> usize {
    256
}

/// Top-level settings for the crate.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// The flyer and its data channels.
    pub flyer: FlyerSettings,
    /// Optional two-stage taxi/fly sequencing.
    #[serde(default)]
    pub taxi_fly: Option<TaxiFlySettings>,
}

/// Settings for one [`FlyerController`].
#[derive(Debug, Clone, Deserialize)]
pub struct FlyerSettings {
    /// Controller name, used for run documents and diagnostics.
    #[serde(default = "default_flyer_name")]
    pub name: String,
    /// Connection string of the trigger flag register.
    pub trigger: String,
    /// Channel that carries per-record timestamps, if any.
    #[serde(default)]
    pub time_channel: Option<String>,
    /// Timestamp reporting convention.
    #[serde(default)]
    pub timestamps: TimestampMode,
    /// Default bound for `wait`.
    #[serde(with = "humantime_serde", default = "default_wait_timeout")]
    pub wait_timeout: Duration,
    /// The data channels, in schema/record order.
    pub channels: Vec<ChannelSettings>,
}

/// Settings for one data channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSettings {
    /// Channel name, used as the schema/record key.
    pub name: String,
    /// Connection string of the waveform register.
    pub address: String,
    /// Maximum element count of the waveform register.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Physical units announced in the schema.
    #[serde(default)]
    pub units: String,
}

/// Settings for the taxi/fly phase pair.
#[derive(Debug, Clone, Deserialize)]
pub struct TaxiFlySettings {
    /// The preparatory phase.
    pub taxi: PhaseSettings,
    /// The main phase.
    pub fly: PhaseSettings,
}

/// Settings for one phase flag.
#[derive(Debug, Clone, Deserialize)]
pub struct PhaseSettings {
    /// Connection string of the phase flag register.
    pub flag: String,
    /// Completion bound for this phase.
    #[serde(with = "humantime_serde", default = "default_wait_timeout")]
    pub timeout: Duration,
}

impl Settings {
    /// Load settings from `path` (or `flyscan.toml` in the working
    /// directory when `None`), apply `FLYSCAN`-prefixed environment
    /// overrides, then validate.
    pub fn new(path: Option<&Path>) -> FlyResult<Self> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(File::with_name("flyscan").required(false)),
        };
        let settings: Settings = builder
            .add_source(Environment::with_prefix("FLYSCAN").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what parsing can catch.
    pub fn validate(&self) -> FlyResult<()> {
        if self.flyer.channels.is_empty() {
            return Err(FlyError::Configuration(
                "at least one data channel is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for channel in &self.flyer.channels {
            if !names.insert(channel.name.as_str()) {
                return Err(FlyError::Configuration(format!(
                    "duplicate channel name '{}'",
                    channel.name
                )));
            }
            if channel.capacity == 0 {
                return Err(FlyError::Configuration(format!(
                    "channel '{}' has zero capacity",
                    channel.name
                )));
            }
        }

        if let Some(time) = &self.flyer.time_channel {
            if !names.contains(time.as_str()) {
                return Err(FlyError::Configuration(format!(
                    "time channel '{time}' names no configured channel"
                )));
            }
        }
        Ok(())
    }

    /// Construct the flyer with its register collaborators wired in.
    pub fn build_flyer(&self) -> FlyerController {
        let trigger = FlagChannel::new(&self.flyer.trigger);
        let channels = self
            .flyer
            .channels
            .iter()
            .map(|ch| {
                let buffer = WaveformBuffer::new(&ch.address, ch.capacity);
                DataChannel::new(&ch.name, buffer).with_units(&ch.units)
            })
            .collect();

        let mut flyer = FlyerController::new(&self.flyer.name, trigger, channels)
            .with_timestamp_mode(self.flyer.timestamps);
        if let Some(time) = &self.flyer.time_channel {
            flyer = flyer.with_time_channel(time);
        }
        flyer
    }

    /// Construct the taxi/fly orchestrator, if configured.
    pub fn build_orchestrator(&self) -> Option<TaxiFlyOrchestrator> {
        let taxi_fly = self.taxi_fly.as_ref()?;
        Some(TaxiFlyOrchestrator::new(
            FlightPhase::new(
                "taxi",
                FlagChannel::new(&taxi_fly.taxi.flag),
                taxi_fly.taxi.timeout,
            ),
            FlightPhase::new(
                "fly",
                FlagChannel::new(&taxi_fly.fly.flag),
                taxi_fly.fly.timeout,
            ),
        ))
    }
}
