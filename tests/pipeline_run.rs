use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use traffic_monitor::pipeline::Persistence;
use traffic_monitor::{
    AnnotatedFrame, BoundingBox, Categories, CountPolicy, CountSnapshot, Decision, Detection,
    DetectionCapability, DetectionSet, DetectorBackend, FaultKind, Frame, FrameReport,
    InferenceParams, InferenceView, MemorySource, OutputSink, OutputSpec, Pipeline,
    PipelineConfig, PipelineError, Presenter, SteppingClock, StepOutcome, StopHandle, StopReason,
};

// -------------------- fakes --------------------

/// Detector that records the frames it sees and returns a fixed answer.
struct ScriptedDetector {
    seen: Arc<Mutex<Vec<u64>>>,
    answer: Vec<Detection>,
    fail_on_call: Option<usize>,
    tracking: bool,
}

impl DetectorBackend for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        capability == DetectionCapability::ObjectDetection
            || (self.tracking && capability == DetectionCapability::Tracking)
    }

    fn infer(&mut self, view: &InferenceView<'_>, _: &InferenceParams) -> Result<DetectionSet> {
        let mut seen = self.seen.lock().unwrap();
        if self.fail_on_call == Some(seen.len()) {
            return Err(anyhow!("accelerator reset"));
        }
        seen.push(view.seq());
        Ok(DetectionSet::new(self.answer.clone()))
    }
}

/// Sink that records the sequence number of every written frame.
struct RecordingSink {
    written: Arc<Mutex<Vec<u64>>>,
    closes: Arc<Mutex<u32>>,
    fail_on_write: Option<usize>,
    finished: bool,
}

impl OutputSink for RecordingSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let mut written = self.written.lock().unwrap();
        if self.fail_on_write == Some(written.len()) {
            return Err(anyhow!("disk full"));
        }
        written.push(frame.seq);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.finished {
            self.finished = true;
            *self.closes.lock().unwrap() += 1;
        }
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.written.lock().unwrap().len() as u64
    }
}

/// Presenter that keeps every report and can request a stop after N frames.
struct CapturingPresenter {
    reports: Arc<Mutex<Vec<FrameReport>>>,
    stop_after: Option<(u64, StopHandle)>,
}

impl Presenter for CapturingPresenter {
    fn present(&mut self, _: &AnnotatedFrame, _: &CountSnapshot, report: &FrameReport) {
        self.reports.lock().unwrap().push(*report);
        if let Some((limit, handle)) = &self.stop_after {
            if report.index + 1 >= *limit {
                handle.request_stop();
            }
        }
    }
}

struct Harness {
    pipeline: Pipeline,
    seen: Arc<Mutex<Vec<u64>>>,
    written: Arc<Mutex<Vec<u64>>>,
    closes: Arc<Mutex<u32>>,
    reports: Arc<Mutex<Vec<FrameReport>>>,
}

struct Setup {
    frames: usize,
    skip_interval: u32,
    answer: Vec<Detection>,
    fail_on_call: Option<usize>,
    fail_on_write: Option<usize>,
    fail_open: bool,
    tracking: bool,
    count_policy: CountPolicy,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            frames: 7,
            skip_interval: 2,
            answer: Vec::new(),
            fail_on_call: None,
            fail_on_write: None,
            fail_open: false,
            tracking: false,
            count_policy: CountPolicy::All,
        }
    }
}

fn categories() -> Categories {
    Categories::new(["car", "bus", "truck", "bike", "van"]).unwrap()
}

fn harness(setup: Setup) -> Harness {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let written = Arc::new(Mutex::new(Vec::new()));
    let closes = Arc::new(Mutex::new(0));
    let reports = Arc::new(Mutex::new(Vec::new()));

    let config = PipelineConfig {
        skip_interval: setup.skip_interval,
        categories: categories(),
        count_policy: setup.count_policy,
        output: Some(traffic_monitor::config::OutputTarget {
            path: "unused.rgb".into(),
            format: Default::default(),
            frame_rate: None,
        }),
        ..PipelineConfig::default()
    };
    let detector = ScriptedDetector {
        seen: seen.clone(),
        answer: setup.answer,
        fail_on_call: setup.fail_on_call,
        tracking: setup.tracking,
    };
    let (sink_written, sink_closes) = (written.clone(), closes.clone());
    let fail_open = setup.fail_open;
    let fail_on_write = setup.fail_on_write;
    let opener = move |_: &OutputSpec| -> Result<Box<dyn OutputSink>> {
        if fail_open {
            return Err(anyhow!("permission denied"));
        }
        Ok(Box::new(RecordingSink {
            written: sink_written.clone(),
            closes: sink_closes.clone(),
            fail_on_write,
            finished: false,
        }))
    };

    let pipeline = Pipeline::new(
        config,
        Box::new(MemorySource::solid(setup.frames, 16, 16).unwrap()),
        Box::new(detector),
    )
    .unwrap()
    .with_sink_opener(Box::new(opener))
    .with_presenter(Box::new(CapturingPresenter {
        reports: reports.clone(),
        stop_after: None,
    }))
    .with_clock(Box::new(SteppingClock::new(Duration::from_millis(40))));

    Harness {
        pipeline,
        seen,
        written,
        closes,
        reports,
    }
}

fn det(category_id: i64) -> Detection {
    Detection::new(category_id, 0.9, BoundingBox::from_corners(1.0, 1.0, 8.0, 8.0))
}

// -------------------- scheduling --------------------

#[test]
fn seven_frames_with_skip_two_reuse_the_latest_inference() {
    let mut h = harness(Setup::default());
    let summary = h.pipeline.run().unwrap();

    assert_eq!(*h.seen.lock().unwrap(), vec![0, 3, 6]);
    assert_eq!(*h.written.lock().unwrap(), vec![0, 0, 0, 3, 3, 3, 6]);
    assert_eq!(summary.reason, StopReason::SourceExhausted);
    assert_eq!(summary.frames_processed, 7);
    assert_eq!(summary.inferences, 3);
    assert_eq!(summary.frames_written, 7);
    assert_eq!(summary.persistence, Persistence::Active);

    let reports = h.reports.lock().unwrap();
    let inferred: Vec<bool> = reports.iter().map(|r| r.inferred).collect();
    assert_eq!(inferred, vec![true, false, false, true, false, false, true]);
    let overlays: Vec<u64> = reports.iter().map(|r| r.source_seq).collect();
    assert_eq!(overlays, vec![0, 0, 0, 3, 3, 3, 6]);
}

#[test]
fn every_input_frame_is_written_once_and_inference_count_is_ceiling() {
    for skip in [0u32, 1, 2, 5] {
        for frames in [1usize, 2, 6, 11] {
            let mut h = harness(Setup {
                frames,
                skip_interval: skip,
                ..Setup::default()
            });
            let summary = h.pipeline.run().unwrap();
            let expected_inferences = (frames as u64).div_ceil(skip as u64 + 1);
            assert_eq!(h.written.lock().unwrap().len(), frames, "skip={skip} n={frames}");
            assert_eq!(summary.inferences, expected_inferences, "skip={skip} n={frames}");
            let seen = h.seen.lock().unwrap();
            assert!(seen.iter().all(|seq| seq % (skip as u64 + 1) == 0));
        }
    }
}

#[test]
fn step_by_step_reports_decisions() {
    let mut h = harness(Setup {
        frames: 3,
        skip_interval: 1,
        ..Setup::default()
    });
    h.pipeline.start().unwrap();
    let outcomes: Vec<StepOutcome> = (0..4).map(|_| h.pipeline.step().unwrap()).collect();
    assert_eq!(
        outcomes,
        vec![
            StepOutcome::Processed {
                index: 0,
                decision: Decision::Infer,
            },
            StepOutcome::Processed {
                index: 1,
                decision: Decision::Reuse,
            },
            StepOutcome::Processed {
                index: 2,
                decision: Decision::Infer,
            },
            StepOutcome::Stopped(StopReason::SourceExhausted),
        ]
    );
}

// -------------------- counts --------------------

#[test]
fn counts_follow_the_latest_inference() {
    let mut h = harness(Setup {
        answer: vec![det(2), det(2), det(99)],
        ..Setup::default()
    });
    let summary = h.pipeline.run().unwrap();
    let counts = summary.last_counts.expect("counts after inference");
    assert_eq!(counts.get("truck"), Some(2));
    assert_eq!(counts.total(), 2);
    assert_eq!(summary.track_totals.total(), 0);
}

#[test]
fn stable_tracks_are_tallied_once_per_run() {
    let mut h = harness(Setup {
        answer: vec![det(0).with_track(7), det(1).with_track(8), det(1)],
        tracking: true,
        ..Setup::default()
    });
    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.track_totals.get("car"), Some(1));
    assert_eq!(summary.track_totals.get("bus"), Some(1));
    assert_eq!(summary.last_counts.unwrap().get("bus"), Some(2));
}

#[test]
fn tracked_only_counting_skips_untracked_detections() {
    let mut h = harness(Setup {
        answer: vec![det(0).with_track(7), det(1).with_track(8), det(1)],
        tracking: true,
        count_policy: CountPolicy::TrackedOnly,
        ..Setup::default()
    });
    let summary = h.pipeline.run().unwrap();
    let counts = summary.last_counts.unwrap();
    assert_eq!(counts.get("car"), Some(1));
    assert_eq!(counts.get("bus"), Some(1));
}

#[test]
fn tracked_only_counting_needs_a_tracking_detector() {
    let config = PipelineConfig {
        categories: categories(),
        count_policy: CountPolicy::TrackedOnly,
        ..PipelineConfig::default()
    };
    let detector = ScriptedDetector {
        seen: Arc::new(Mutex::new(Vec::new())),
        answer: vec![det(3); 4],
        fail_on_call: None,
        tracking: false,
    };
    let seen = detector.seen.clone();
    let err = match Pipeline::new(
        config,
        Box::new(MemorySource::solid(6, 16, 16).unwrap()),
        Box::new(detector),
    ) {
        Ok(_) => panic!("tracked_only with a detect-only backend must be rejected"),
        Err(err) => err,
    };
    assert_eq!(PipelineError::kind_of(&err), Some(FaultKind::ConfigError));
    assert!(err.to_string().contains("scripted"));
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn persistent_tracking_on_a_detect_only_backend_still_runs() {
    let mut config = PipelineConfig {
        categories: categories(),
        ..PipelineConfig::default()
    };
    config.inference.persist_tracking = true;
    let detector = ScriptedDetector {
        seen: Arc::new(Mutex::new(Vec::new())),
        answer: vec![det(3); 4],
        fail_on_call: None,
        tracking: false,
    };
    let mut pipeline = Pipeline::new(
        config,
        Box::new(MemorySource::solid(6, 16, 16).unwrap()),
        Box::new(detector),
    )
    .unwrap();
    let summary = pipeline.run().unwrap();
    assert_eq!(summary.reason, StopReason::SourceExhausted);
    assert_eq!(summary.last_counts.unwrap().get("bike"), Some(4));
    assert_eq!(summary.track_totals.total(), 0);
}

// -------------------- faults --------------------

#[test]
fn model_failure_writes_the_raw_frame_and_stops() {
    let mut h = harness(Setup {
        fail_on_call: Some(1),
        ..Setup::default()
    });
    let summary = h.pipeline.run().unwrap();

    assert_eq!(summary.reason, StopReason::ModelFailure);
    assert_eq!(summary.frames_processed, 4);
    assert_eq!(*h.written.lock().unwrap(), vec![0, 0, 0, 3]);
    assert_eq!(summary.frames_written, 4);
    assert_eq!(*h.closes.lock().unwrap(), 1);
}

#[test]
fn open_failure_runs_without_persistence() {
    let mut h = harness(Setup {
        fail_open: true,
        ..Setup::default()
    });
    let summary = h.pipeline.run().unwrap();

    assert_eq!(summary.reason, StopReason::SourceExhausted);
    assert_eq!(summary.frames_processed, 7);
    assert_eq!(summary.inferences, 3);
    assert_eq!(summary.frames_written, 0);
    match &summary.persistence {
        Persistence::Disabled(reason) => assert!(reason.contains("OPEN_ERROR"), "{reason}"),
        other => panic!("expected disabled persistence, got {other:?}"),
    }
    assert!(h.reports.lock().unwrap().iter().all(|r| !r.persisting));
}

#[test]
fn write_failure_disables_persistence_for_the_rest_of_the_run() {
    let mut h = harness(Setup {
        fail_on_write: Some(2),
        ..Setup::default()
    });
    let summary = h.pipeline.run().unwrap();

    assert_eq!(summary.frames_processed, 7);
    assert_eq!(summary.frames_written, 2);
    assert_eq!(*h.written.lock().unwrap(), vec![0, 0]);
    assert!(matches!(summary.persistence, Persistence::Disabled(_)));
    assert_eq!(*h.closes.lock().unwrap(), 1);
}

#[test]
fn unconnectable_source_fails_start() {
    struct DeadSource;
    impl traffic_monitor::FrameSource for DeadSource {
        fn connect(&mut self) -> Result<traffic_monitor::SourceInfo> {
            Err(anyhow!("no such file"))
        }
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            Ok(None)
        }
        fn describe(&self) -> String {
            "dead".to_string()
        }
    }

    let mut pipeline = Pipeline::new(
        PipelineConfig::default(),
        Box::new(DeadSource),
        Box::new(traffic_monitor::StubBackend::new()),
    )
    .unwrap();
    assert!(pipeline.run().is_err());
    assert_eq!(pipeline.stop().reason, StopReason::SourceFailure);
}

// -------------------- stopping --------------------

#[test]
fn stop_is_idempotent_and_closes_the_sink_once() {
    let mut h = harness(Setup::default());
    h.pipeline.start().unwrap();
    h.pipeline.step().unwrap();
    h.pipeline.step().unwrap();

    let first = h.pipeline.stop();
    let second = h.pipeline.stop();
    assert_eq!(first.reason, StopReason::StopRequested);
    assert_eq!(second.reason, first.reason);
    assert_eq!(second.frames_processed, 2);
    assert_eq!(second.frames_written, first.frames_written);
    assert_eq!(*h.closes.lock().unwrap(), 1);
    assert_eq!(
        h.pipeline.step().unwrap(),
        StepOutcome::Stopped(StopReason::StopRequested)
    );
}

#[test]
fn external_stop_request_is_seen_at_the_next_frame() {
    let mut h = harness(Setup {
        frames: 20,
        ..Setup::default()
    });
    let handle = h.pipeline.stop_handle();
    let reports = h.reports.clone();
    h.pipeline = h.pipeline.with_presenter(Box::new(CapturingPresenter {
        reports,
        stop_after: Some((5, handle)),
    }));

    let summary = h.pipeline.run().unwrap();
    assert_eq!(summary.reason, StopReason::StopRequested);
    assert_eq!(summary.frames_processed, 5);
    assert_eq!(h.written.lock().unwrap().len(), 5);
}

#[test]
fn config_errors_surface_before_any_frame_is_read() {
    let config = PipelineConfig {
        inference: InferenceParams {
            resolution: 0,
            ..InferenceParams::default()
        },
        ..PipelineConfig::default()
    };
    let err = match Pipeline::new(
        config,
        Box::new(MemorySource::solid(1, 16, 16).unwrap()),
        Box::new(traffic_monitor::StubBackend::new()),
    ) {
        Ok(_) => panic!("zero resolution must be rejected"),
        Err(err) => err,
    };
    assert_eq!(PipelineError::kind_of(&err), Some(FaultKind::ConfigError));
}

#[test]
fn smoothed_rate_is_reported_per_frame() {
    let mut h = harness(Setup {
        frames: 3,
        ..Setup::default()
    });
    h.pipeline.run().unwrap();
    let rates: Vec<f64> = h.reports.lock().unwrap().iter().map(|r| r.rate).collect();
    assert_eq!(rates[0], 0.0);
    assert!((rates[1] - 2.5).abs() < 1e-9);
    assert!(rates[2] > rates[1]);
}
