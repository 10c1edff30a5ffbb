//! Run-event documents for recording sinks.
//!
//! A completed fly-scan cycle is published to an external recorder as a
//! small document stream:
//!
//! ```text
//! Start (1)
//!    │
//!    ├── Descriptor (1, schema announced before the first record)
//!    │       │
//!    │       └── Event (N, one per drained record)
//!    │
//! Stop (1)
//! ```
//!
//! The names used in an event's data mapping and timestamp mapping are
//! identical to the names announced in the descriptor — both are derived
//! from the same channel list, so the guarantee holds by construction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::flyer::{FlyRecord, FlyerController};

/// Generate a new unique document ID.
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Convert a timestamp to epoch seconds.
pub fn epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 * 1e-6
}

fn now_epoch() -> f64 {
    epoch_seconds(Utc::now())
}

/// Document types emitted for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    Start(StartDoc),
    Descriptor(DescriptorDoc),
    Event(EventDoc),
    Stop(StopDoc),
}

impl Document {
    /// The document UID.
    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// The run UID this document belongs to.
    pub fn run_uid(&self) -> &str {
        match self {
            // The start doc UID is the run UID.
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    /// Document timestamp in epoch seconds.
    pub fn time(&self) -> f64 {
        match self {
            Document::Start(d) => d.time,
            Document::Descriptor(d) => d.time,
            Document::Event(d) => d.time,
            Document::Stop(d) => d.time,
        }
    }
}

/// Start-of-run signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run UID).
    pub uid: String,
    /// Name of the flyer that produced this run.
    pub flyer: String,
    /// User-provided metadata.
    pub metadata: HashMap<String, String>,
    /// Timestamp when the run started.
    pub time: f64,
}

impl StartDoc {
    pub fn new(flyer: &str) -> Self {
        Self {
            uid: new_uid(),
            flyer: flyer.to_string(),
            metadata: HashMap::new(),
            time: now_epoch(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Schema for one data field within events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Source register address.
    pub source: String,
    /// Declared type; always "number" for waveform-backed channels.
    pub dtype: String,
    /// Shape `(1,)` — one scalar per record.
    pub shape: Vec<i32>,
    /// Physical units, empty when unknown.
    pub units: String,
}

impl DataKey {
    /// A scalar-per-record numeric key sourced from `source`.
    pub fn number(source: &str) -> Self {
        Self {
            source: source.to_string(),
            dtype: "number".to_string(),
            shape: vec![1],
            units: String::new(),
        }
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self
    }
}

/// Schema announcement for the run's data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Unique descriptor ID.
    pub uid: String,
    /// Links to the start document.
    pub run_uid: String,
    /// Stream name (a flyer emits a single "primary" stream).
    pub stream: String,
    /// Per-channel schema, keyed by channel name.
    pub data_keys: HashMap<String, DataKey>,
    /// Timestamp.
    pub time: f64,
}

impl DescriptorDoc {
    pub fn new(run_uid: &str, stream: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            stream: stream.to_string(),
            data_keys: HashMap::new(),
            time: now_epoch(),
        }
    }

    pub fn with_data_keys(mut self, data_keys: HashMap<String, DataKey>) -> Self {
        self.data_keys = data_keys;
        self
    }
}

/// One drained record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Unique event ID.
    pub uid: String,
    /// Links to the start document.
    pub run_uid: String,
    /// Links to the descriptor that defines the schema.
    pub descriptor_uid: String,
    /// Event sequence number within the run, from 0.
    pub seq_num: u32,
    /// Record emission timestamp, epoch seconds.
    pub time: f64,
    /// Channel name → value.
    pub data: HashMap<String, f64>,
    /// Channel name → associated timestamp, keyed identically to `data`.
    pub timestamps: HashMap<String, f64>,
}

impl EventDoc {
    /// Wrap one drained record.
    pub fn from_record(
        run_uid: &str,
        descriptor_uid: &str,
        seq_num: u32,
        record: FlyRecord,
    ) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time: epoch_seconds(record.time),
            data: record.data,
            timestamps: record.timestamps,
        }
    }
}

/// End-of-run signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Unique stop doc ID.
    pub uid: String,
    /// Links to the start document.
    pub run_uid: String,
    /// Exit status: "success" or "fail".
    pub exit_status: String,
    /// Reason, empty on success.
    pub reason: String,
    /// Total events emitted.
    pub num_events: u32,
    /// Timestamp when the run ended.
    pub time: f64,
}

impl StopDoc {
    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: "success".to_string(),
            reason: String::new(),
            num_events,
            time: now_epoch(),
        }
    }

    pub fn fail(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: "fail".to_string(),
            reason: reason.to_string(),
            num_events,
            time: now_epoch(),
        }
    }
}

/// Consumer of the run-event document stream.
///
/// Implementations receive documents in order: start, descriptor, events,
/// stop. A sink that cannot accept a document returns an error, which stops
/// the emission.
pub trait EventSink {
    /// Handle one document.
    fn receive(&mut self, document: &Document) -> anyhow::Result<()>;
}

/// Publish one completed cycle as a document stream: start-of-run, the
/// schema announcement, one event per drained record, end-of-run.
///
/// Consumes the flyer's completed cycle (see
/// [`FlyerController::drain`]); nothing is emitted unless the drain
/// succeeds. Returns the run UID.
pub fn emit_run(flyer: &mut FlyerController, sink: &mut dyn EventSink) -> anyhow::Result<String> {
    let schema = flyer.schema();
    let records = flyer.drain()?;

    let start = StartDoc::new(flyer.name());
    let run_uid = start.uid.clone();
    sink.receive(&Document::Start(start))?;

    let descriptor = DescriptorDoc::new(&run_uid, "primary").with_data_keys(schema);
    let descriptor_uid = descriptor.uid.clone();
    sink.receive(&Document::Descriptor(descriptor))?;

    let mut num_events = 0u32;
    for record in records {
        let event = EventDoc::from_record(&run_uid, &descriptor_uid, num_events, record);
        sink.receive(&Document::Event(event))?;
        num_events += 1;
    }

    sink.receive(&Document::Stop(StopDoc::success(&run_uid, num_events)))?;
    info!(run = %run_uid, events = num_events, "run emitted");
    Ok(run_uid)
}
