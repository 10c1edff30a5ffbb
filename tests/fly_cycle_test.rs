//! End-to-end fly-scan cycles against a simulated remote controller.

use std::io::Write;
use std::thread;
use std::time::Duration;

use chrono::Utc;

use flyscan::config::Settings;
use flyscan::document::{emit_run, epoch_seconds, Document, EventSink};
use flyscan::flyer::{FlyRecord, FlyerController, FlyerState};
use flyscan::signal::{FlagState, WaveformBuffer};

const CONFIG: &str = r#"
    [flyer]
    name = "busy_flyer"
    trigger = "prj:mybusy"
    time_channel = "t"
    timestamps = "absolute"
    wait_timeout = "5s"

    [[flyer.channels]]
    name = "t"
    address = "prj:t_array"
    units = "s"

    [[flyer.channels]]
    name = "x"
    address = "prj:x_array"
    units = "mm"

    [[flyer.channels]]
    name = "y"
    address = "prj:y_array"
"#;

const XS: [f64; 3] = [-1.23, 0.87, 2.97];
const YS: [f64; 3] = [0.069, 0.274, 0.027];
const DTS: [f64; 3] = [0.018, 0.019, 0.022];

fn load_flyer() -> FlyerController {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    let settings = Settings::new(Some(file.path())).unwrap();
    settings.build_flyer()
}

/// Simulate the remote controller: once the busy flag is raised, fill the
/// waveform registers step by step, then signal done.
fn spawn_remote(flyer: &FlyerController, step_delay: Duration) {
    let channel_of = |name: &str| -> WaveformBuffer {
        flyer
            .channels()
            .iter()
            .find(|ch| ch.name() == name)
            .map(|ch| ch.buffer().clone())
            .unwrap()
    };
    let (t, x, y) = (channel_of("t"), channel_of("x"), channel_of("y"));
    let trigger = flyer.trigger().clone();

    flyer.trigger().subscribe(move |_old, new| {
        if new != FlagState::Busy {
            return;
        }
        let (t, x, y, flag) = (t.clone(), x.clone(), y.clone(), trigger.clone());
        thread::spawn(move || {
            t.reset();
            x.reset();
            y.reset();
            let t0 = epoch_seconds(Utc::now());
            for i in 0..3 {
                thread::sleep(step_delay);
                t.post(t0 + DTS[i]);
                x.post(XS[i]);
                y.post(YS[i]);
            }
            thread::sleep(step_delay);
            flag.write(FlagState::Done);
        });
    });
}

#[test]
fn test_full_cycle_yields_records_verbatim() {
    let mut flyer = load_flyer();
    spawn_remote(&flyer, Duration::from_millis(5));
    let t_address = flyer.channels()[0].buffer().address().to_string();

    flyer.arm().unwrap();
    flyer.wait(Duration::from_secs(5)).unwrap();

    let schema = flyer.schema();
    let records: Vec<FlyRecord> = flyer.drain().unwrap().collect();
    assert_eq!(records.len(), 3);

    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.data["x"], XS[i]);
        assert_eq!(record.data["y"], YS[i]);
        // Absolute convention: the t value is the time-channel sample.
        assert_eq!(record.timestamps["t"], record.data["t"]);
        assert_eq!(record.timestamps["x"], record.timestamps["y"]);
        for name in record.data.keys() {
            assert!(schema.contains_key(name));
        }
    }
    // Time-channel samples and emission timestamps are in index order.
    assert!(records.windows(2).all(|w| w[0].data["t"] < w[1].data["t"]));
    assert!(records.windows(2).all(|w| w[0].time <= w[1].time));
    assert_eq!(schema["t"].source, t_address);
}

#[test]
fn test_controller_supports_repeated_cycles() {
    let mut flyer = load_flyer();
    spawn_remote(&flyer, Duration::from_millis(2));

    for _ in 0..3 {
        flyer.arm().unwrap();
        flyer.wait(Duration::from_secs(5)).unwrap();
        let records: Vec<FlyRecord> = flyer.drain().unwrap().collect();
        assert_eq!(records.len(), 3);
        assert_eq!(flyer.state(), FlyerState::Idle);
    }
}

#[test]
fn test_completion_before_wait_is_not_missed() {
    let mut flyer = load_flyer();
    spawn_remote(&flyer, Duration::from_millis(1));

    flyer.arm().unwrap();
    // Let the remote controller finish before wait is ever called; the
    // wait must observe resolution state, not the notification event.
    let handle = flyer.wait_handle().unwrap();
    while !handle.is_resolved() {
        thread::sleep(Duration::from_millis(1));
    }
    flyer.wait(Duration::from_millis(1)).unwrap();
    assert_eq!(flyer.state(), FlyerState::Completed);
    assert_eq!(flyer.drain().unwrap().count(), 3);
}

#[derive(Default)]
struct CollectingSink {
    documents: Vec<Document>,
}

impl EventSink for CollectingSink {
    fn receive(&mut self, document: &Document) -> anyhow::Result<()> {
        self.documents.push(document.clone());
        Ok(())
    }
}

#[test]
fn test_document_stream_ordering_and_names() {
    let mut flyer = load_flyer();
    spawn_remote(&flyer, Duration::from_millis(2));

    flyer.arm().unwrap();
    flyer.wait(Duration::from_secs(5)).unwrap();

    let mut sink = CollectingSink::default();
    let run_uid = emit_run(&mut flyer, &mut sink).unwrap();

    let docs = &sink.documents;
    assert_eq!(docs.len(), 6); // start + descriptor + 3 events + stop
    assert!(docs.iter().all(|d| d.run_uid() == run_uid));

    let Document::Start(start) = &docs[0] else {
        panic!("first document must be start");
    };
    assert_eq!(start.flyer, "busy_flyer");

    let Document::Descriptor(descriptor) = &docs[1] else {
        panic!("second document must be the descriptor");
    };

    for (seq, doc) in docs[2..5].iter().enumerate() {
        let Document::Event(event) = doc else {
            panic!("expected event document");
        };
        assert_eq!(event.seq_num as usize, seq);
        assert_eq!(event.descriptor_uid, descriptor.uid);
        // Data mapping, timestamp mapping, and schema share one key set.
        let mut data_names: Vec<_> = event.data.keys().collect();
        let mut stamp_names: Vec<_> = event.timestamps.keys().collect();
        let mut schema_names: Vec<_> = descriptor.data_keys.keys().collect();
        data_names.sort();
        stamp_names.sort();
        schema_names.sort();
        assert_eq!(data_names, stamp_names);
        assert_eq!(data_names, schema_names);
    }

    let Document::Stop(stop) = &docs[5] else {
        panic!("last document must be stop");
    };
    assert_eq!(stop.exit_status, "success");
    assert_eq!(stop.num_events, 3);
}

#[test]
fn test_emit_run_refuses_incomplete_cycle() {
    let mut flyer = load_flyer();
    let mut sink = CollectingSink::default();
    assert!(emit_run(&mut flyer, &mut sink).is_err());
    assert!(sink.documents.is_empty());
}
