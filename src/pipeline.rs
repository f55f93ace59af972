//! Pipeline driver.
//!
//! One `Pipeline` owns every stage and the run state. It moves through
//! `Idle -> Running -> Stopped` exactly once. Each `step` processes one frame:
//!
//! 1. advance the frame counter (the value before the increment is the frame index)
//! 2. ask the scheduler
//! 3. infer and cache, or read the cache
//! 4. write one output frame
//! 5. sample metrics
//! 6. present
//!
//! Other threads never see the live state. After every frame the driver
//! publishes a frozen `PipelineSnapshot` on a `SnapshotBoard`.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::cache::AnnotationCache;
use crate::config::PipelineConfig;
use crate::counts::{aggregate_with, CountPolicy, CountSnapshot, TrackTally};
use crate::detect::{DetectionCapability, DetectorBackend};
use crate::frame::{AnnotatedFrame, Frame};
use crate::ingest::{FrameSource, SourceInfo};
use crate::metrics::{Clock, RateTracker, SystemClock};
use crate::present::{FrameReport, NullPresenter, Presenter};
use crate::render::{BoxAnnotator, FrameAnnotator};
use crate::resources::{ResourceMonitor, ResourceReading};
use crate::scheduler::{Decision, Scheduler};
use crate::sink::{FileSinkOpener, OutputSink, OutputSpec, SinkOpener, FALLBACK_FRAME_RATE};
use crate::{FaultKind, PipelineError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Running,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    SourceExhausted,
    StopRequested,
    ModelFailure,
    SourceFailure,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StopReason::SourceExhausted => "source exhausted",
            StopReason::StopRequested => "stop requested",
            StopReason::ModelFailure => "model failure",
            StopReason::SourceFailure => "source failure",
        };
        f.write_str(text)
    }
}

/// State of the output stream over a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum Persistence {
    /// No output configured.
    Off,
    Active,
    /// Open or write failed; the run went on without output.
    Disabled(String),
}

impl Persistence {
    pub fn is_active(&self) -> bool {
        matches!(self, Persistence::Active)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Processed { index: u64, decision: Decision },
    Stopped(StopReason),
}

/// Final status of a run. Logged once when the run stops.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub reason: StopReason,
    pub frames_processed: u64,
    pub inferences: u64,
    pub frames_written: u64,
    pub persistence: Persistence,
    pub final_rate: f64,
    pub last_counts: Option<CountSnapshot>,
    pub track_totals: CountSnapshot,
}

// ----------------------------------------------------------------------------
// Stop handle / snapshot board
// ----------------------------------------------------------------------------

/// Clonable external stop request. Observed at the top of the next step.
#[derive(Clone, Debug, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Frozen view of a run after a frame, for readers on other threads.
#[derive(Clone, Debug)]
pub struct PipelineSnapshot {
    pub phase: Phase,
    pub frames_processed: u64,
    pub inferences: u64,
    pub frames_written: u64,
    pub rate: f64,
    pub counts: Arc<CountSnapshot>,
    pub last_inferred_seq: Option<u64>,
    pub resources: ResourceReading,
    pub persisting: bool,
}

#[derive(Clone, Debug, Default)]
pub struct SnapshotBoard {
    latest: Arc<RwLock<Option<Arc<PipelineSnapshot>>>>,
}

impl SnapshotBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: PipelineSnapshot) {
        let mut slot = self.latest.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(snapshot));
    }

    pub fn latest(&self) -> Option<Arc<PipelineSnapshot>> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

// ----------------------------------------------------------------------------
// Run state
// ----------------------------------------------------------------------------

/// Mutable state of one run. Created at start, dropped with the pipeline.
#[derive(Debug)]
pub struct PipelineState {
    frame_counter: u64,
    cache: AnnotationCache,
    rate: RateTracker,
    inferences: u64,
    frames_written: u64,
    tally: TrackTally,
    resources: ResourceReading,
}

impl PipelineState {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            frame_counter: 0,
            cache: AnnotationCache::new(&config.categories),
            rate: RateTracker::new(),
            inferences: 0,
            frames_written: 0,
            tally: TrackTally::new(&config.categories),
            resources: ResourceReading::default(),
        }
    }

    /// Frames taken from the source so far.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn cache(&self) -> &AnnotationCache {
        &self.cache
    }

    pub fn smoothed_rate(&self) -> f64 {
        self.rate.smoothed_rate()
    }

    pub fn inferences(&self) -> u64 {
        self.inferences
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn track_totals(&self) -> CountSnapshot {
        self.tally.snapshot()
    }
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

pub struct Pipeline {
    config: PipelineConfig,
    scheduler: Scheduler,
    source: Box<dyn FrameSource>,
    detector: Box<dyn DetectorBackend>,
    annotator: Box<dyn FrameAnnotator>,
    opener: Box<dyn SinkOpener>,
    presenter: Box<dyn Presenter>,
    resources: ResourceMonitor,
    clock: Box<dyn Clock>,
    stop: StopHandle,
    board: SnapshotBoard,
    phase: Phase,
    state: PipelineState,
    sink: Option<Box<dyn OutputSink>>,
    persistence: Persistence,
    summary: Option<RunSummary>,
}

impl Pipeline {
    /// Validates `config` against itself and the detector, then assembles an
    /// idle pipeline with default collaborators: box overlays, file sinks, no
    /// presenter, no sensors and the system clock.
    pub fn new(
        config: PipelineConfig,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectorBackend>,
    ) -> Result<Self> {
        config.validate()?;
        if !detector.supports(DetectionCapability::Tracking) {
            if config.count_policy == CountPolicy::TrackedOnly {
                return Err(PipelineError::config(format!(
                    "tracked_only counting needs a tracking detector, '{}' has none",
                    detector.name()
                ))
                .into());
            }
            if config.inference.persist_tracking {
                log::warn!(
                    "detector '{}' does not track objects; persist_tracking has no effect",
                    detector.name()
                );
            }
        }
        let state = PipelineState::new(&config);
        Ok(Self {
            scheduler: Scheduler::new(config.skip_interval),
            config,
            source,
            detector,
            annotator: Box::new(BoxAnnotator::default()),
            opener: Box::new(FileSinkOpener),
            presenter: Box::new(NullPresenter),
            resources: ResourceMonitor::disabled(),
            clock: Box::new(SystemClock),
            stop: StopHandle::new(),
            board: SnapshotBoard::new(),
            phase: Phase::Idle,
            state,
            sink: None,
            persistence: Persistence::Off,
            summary: None,
        })
    }

    pub fn with_annotator(mut self, annotator: Box<dyn FrameAnnotator>) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn with_sink_opener(mut self, opener: Box<dyn SinkOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_presenter(mut self, presenter: Box<dyn Presenter>) -> Self {
        self.presenter = presenter;
        self
    }

    pub fn with_resource_monitor(mut self, resources: ResourceMonitor) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn snapshot_board(&self) -> SnapshotBoard {
        self.board.clone()
    }

    /// `Idle -> Running`. Connects the source, opens the output and resets the
    /// run state. A source that cannot connect stops the run and is returned as
    /// an error; an output that cannot open only disables persistence.
    pub fn start(&mut self) -> Result<()> {
        match self.phase {
            Phase::Idle => {}
            Phase::Running => return Err(anyhow!("pipeline is already running")),
            Phase::Stopped => return Err(anyhow!("pipeline has already stopped")),
        }

        let info = match self.source.connect() {
            Ok(info) => info,
            Err(err) => {
                log::error!("source {} failed to connect: {:#}", self.source.describe(), err);
                self.finish(StopReason::SourceFailure);
                return Err(err.context(format!("connect {}", self.source.describe())));
            }
        };
        self.state = PipelineState::new(&self.config);
        self.detector.reset_tracking();
        if let Err(err) = self.detector.warm_up() {
            log::warn!("detector {} warm-up failed: {:#}", self.detector.name(), err);
        }
        self.open_output(info);

        self.phase = Phase::Running;
        log::info!(
            "pipeline running: source={} {}x{} detector={} skip_interval={} categories={}",
            self.source.describe(),
            info.width,
            info.height,
            self.detector.name(),
            self.config.skip_interval,
            self.config.categories.len()
        );
        Ok(())
    }

    fn open_output(&mut self, info: SourceInfo) {
        let Some(target) = self.config.output.as_ref() else {
            self.persistence = Persistence::Off;
            return;
        };
        let frame_rate = target
            .frame_rate
            .or(info.frame_rate.filter(|r| r.is_finite() && *r > 0.0))
            .or(self.config.fallback_frame_rate)
            .unwrap_or(FALLBACK_FRAME_RATE);
        let spec = OutputSpec {
            path: target.path.clone(),
            width: info.width,
            height: info.height,
            frame_rate,
            format: target.format,
        };
        match self.opener.open(&spec) {
            Ok(sink) => {
                self.sink = Some(sink);
                self.persistence = Persistence::Active;
            }
            Err(err) => self.disable_persistence(err),
        }
    }

    fn disable_persistence(&mut self, err: anyhow::Error) {
        let err = match PipelineError::kind_of(&err) {
            Some(FaultKind::OpenError) => err,
            _ => PipelineError::open(format!("{:#}", err)).into(),
        };
        log::warn!("{}; continuing without persistence", err);
        if let Some(mut sink) = self.sink.take() {
            if let Err(close_err) = sink.finish() {
                log::debug!("closing failed output: {:#}", close_err);
            }
        }
        self.persistence = Persistence::Disabled(err.to_string());
    }

    fn persist(&mut self, frame: &Frame) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        match sink.write(frame) {
            Ok(()) => self.state.frames_written += 1,
            Err(err) => self.disable_persistence(err.context(format!("write frame {}", frame.seq))),
        }
    }

    /// Process one frame.
    pub fn step(&mut self) -> Result<StepOutcome> {
        match self.phase {
            Phase::Idle => return Err(anyhow!("pipeline has not been started")),
            Phase::Stopped => {
                let reason = self
                    .summary
                    .as_ref()
                    .map(|s| s.reason)
                    .unwrap_or(StopReason::StopRequested);
                return Ok(StepOutcome::Stopped(reason));
            }
            Phase::Running => {}
        }

        if self.stop.is_stop_requested() {
            return Ok(StepOutcome::Stopped(self.finish(StopReason::StopRequested).reason));
        }
        if let Some(limit) = self.config.max_frames {
            if self.state.frame_counter >= limit {
                log::info!("frame limit {} reached", limit);
                return Ok(StepOutcome::Stopped(self.finish(StopReason::StopRequested).reason));
            }
        }

        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("{}: {}", FaultKind::SourceExhausted.code(), self.source.describe());
                return Ok(StepOutcome::Stopped(self.finish(StopReason::SourceExhausted).reason));
            }
            Err(err) => {
                log::error!("source {} failed: {:#}", self.source.describe(), err);
                return Ok(StepOutcome::Stopped(self.finish(StopReason::SourceFailure).reason));
            }
        };

        let index = self.state.frame_counter;
        self.state.frame_counter += 1;
        let decision = self.scheduler.decide(index);

        let (output, counts) = match decision {
            Decision::Infer => match self.infer(&frame) {
                Ok(pair) => pair,
                Err(err) => {
                    log::error!("{:#}", err);
                    self.persist(&frame);
                    return Ok(StepOutcome::Stopped(self.finish(StopReason::ModelFailure).reason));
                }
            },
            Decision::Reuse => self.state.cache.read(&frame),
        };
        log::debug!(
            "frame {} {:?} (overlay from {})",
            index,
            decision,
            output.source_seq()
        );

        self.persist(output.frame());

        let now = self.clock.now();
        let rate = self.state.rate.sample(now);
        self.state.resources = self.resources.sample(now);

        let report = FrameReport {
            index,
            source_seq: output.source_seq(),
            inferred: decision == Decision::Infer,
            rate,
            resources: self.state.resources,
            frames_written: self.state.frames_written,
            persisting: self.persistence.is_active(),
        };
        self.presenter.present(&output, &counts, &report);
        self.publish(Phase::Running, counts);

        Ok(StepOutcome::Processed { index, decision })
    }

    fn infer(&mut self, frame: &Frame) -> Result<(Arc<AnnotatedFrame>, Arc<CountSnapshot>)> {
        let mut detections = frame
            .inference_view()
            .run_detector(self.detector.as_mut(), &self.config.inference)
            .map_err(|e| {
                PipelineError::model(format!(
                    "{} failed on frame {}: {:#}",
                    self.detector.name(),
                    frame.seq,
                    e
                ))
            })?;
        detections.retain_confident(self.config.inference.confidence_threshold);

        let counts = aggregate_with(&detections, &self.config.categories, self.config.count_policy);
        self.state.tally.observe(&detections);
        let annotated = match self.annotator.annotate(frame, detections.clone()) {
            Ok(annotated) => annotated,
            Err(err) => {
                log::warn!("overlay for frame {} failed, using raw pixels: {:#}", frame.seq, err);
                AnnotatedFrame::new(frame.clone(), frame.seq, detections)
            }
        };
        self.state.inferences += 1;
        self.state
            .cache
            .update(Arc::new(annotated), Arc::new(counts));
        Ok(self.state.cache.read(frame))
    }

    fn publish(&self, phase: Phase, counts: Arc<CountSnapshot>) {
        self.board.publish(PipelineSnapshot {
            phase,
            frames_processed: self.state.frame_counter,
            inferences: self.state.inferences,
            frames_written: self.state.frames_written,
            rate: self.state.rate.smoothed_rate(),
            counts,
            last_inferred_seq: self.state.cache.last_inferred_seq(),
            resources: self.state.resources,
            persisting: self.persistence.is_active(),
        });
    }

    /// Run until the source is exhausted, a stop is requested or a fatal fault
    /// occurs. Starts the pipeline if it is idle.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.phase == Phase::Idle {
            self.start()?;
        }
        loop {
            if let StepOutcome::Stopped(_) = self.step()? {
                break;
            }
        }
        Ok(self.stop())
    }

    /// Stop the run. Closes the output and releases the source. Safe to call
    /// in any phase; every call after the first returns the same summary.
    pub fn stop(&mut self) -> RunSummary {
        self.finish(StopReason::StopRequested)
    }

    fn finish(&mut self, reason: StopReason) -> RunSummary {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }

        if let Some(mut sink) = self.sink.take() {
            if let Err(err) = sink.finish() {
                let err = PipelineError::open(format!("closing output failed: {:#}", err));
                log::warn!("{}", err);
                self.persistence = Persistence::Disabled(err.to_string());
            }
        }
        self.source.release();
        self.presenter.finish();
        self.phase = Phase::Stopped;

        let last_counts = self.state.cache.last_counts();
        let summary = RunSummary {
            reason,
            frames_processed: self.state.frame_counter,
            inferences: self.state.inferences,
            frames_written: self.state.frames_written,
            persistence: self.persistence.clone(),
            final_rate: self.state.rate.smoothed_rate(),
            last_counts: last_counts.as_deref().cloned(),
            track_totals: self.state.tally.snapshot(),
        };
        let counts = last_counts
            .unwrap_or_else(|| Arc::new(CountSnapshot::zeroed(&self.config.categories)));
        self.publish(Phase::Stopped, counts);

        let log_line = format!(
            "run stopped ({}): frames={} inferences={} written={} rate={:.2} unique_tracks={}",
            summary.reason,
            summary.frames_processed,
            summary.inferences,
            summary.frames_written,
            summary.final_rate,
            summary.track_totals.total()
        );
        match reason {
            StopReason::ModelFailure | StopReason::SourceFailure => log::error!("{}", log_line),
            _ => log::info!("{}", log_line),
        }

        self.summary = Some(summary.clone());
        summary
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.phase == Phase::Running {
            self.finish(StopReason::StopRequested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::Categories;
    use crate::detect::StubBackend;
    use crate::ingest::MemorySource;
    use crate::metrics::SteppingClock;
    use std::time::Duration;

    fn pipeline(frames: usize, skip: u32) -> Pipeline {
        let config = PipelineConfig {
            skip_interval: skip,
            categories: Categories::default(),
            ..PipelineConfig::default()
        };
        Pipeline::new(
            config,
            Box::new(MemorySource::solid(frames, 16, 16).unwrap()),
            Box::new(StubBackend::new()),
        )
        .unwrap()
        .with_clock(Box::new(SteppingClock::new(Duration::from_millis(40))))
    }

    #[test]
    fn step_before_start_is_an_error() {
        let mut p = pipeline(3, 0);
        assert!(p.step().is_err());
        assert_eq!(p.phase(), Phase::Idle);
    }

    #[test]
    fn start_twice_is_rejected() {
        let mut p = pipeline(3, 0);
        p.start().unwrap();
        assert!(p.start().is_err());
    }

    #[test]
    fn run_without_output_keeps_persistence_off() {
        let mut p = pipeline(5, 1);
        let summary = p.run().unwrap();
        assert_eq!(summary.reason, StopReason::SourceExhausted);
        assert_eq!(summary.frames_processed, 5);
        assert_eq!(summary.inferences, 3);
        assert_eq!(summary.frames_written, 0);
        assert_eq!(summary.persistence, Persistence::Off);
        assert!(summary.final_rate > 0.0);
    }

    #[test]
    fn snapshot_board_tracks_progress() {
        let mut p = pipeline(4, 3);
        let board = p.snapshot_board();
        assert!(board.latest().is_none());
        p.start().unwrap();
        p.step().unwrap();
        let snap = board.latest().unwrap();
        assert_eq!(snap.phase, Phase::Running);
        assert_eq!(snap.frames_processed, 1);
        assert_eq!(snap.last_inferred_seq, Some(0));
        p.stop();
        assert_eq!(board.latest().unwrap().phase, Phase::Stopped);
    }

    #[test]
    fn stop_on_idle_pipeline_moves_to_stopped() {
        let mut p = pipeline(2, 0);
        let summary = p.stop();
        assert_eq!(summary.frames_processed, 0);
        assert_eq!(p.phase(), Phase::Stopped);
        assert!(p.start().is_err());
    }

    #[test]
    fn max_frames_limits_the_run() {
        let config = PipelineConfig {
            max_frames: Some(3),
            ..PipelineConfig::default()
        };
        let mut p = Pipeline::new(
            config,
            Box::new(MemorySource::solid(10, 8, 8).unwrap()),
            Box::new(StubBackend::new()),
        )
        .unwrap();
        let summary = p.run().unwrap();
        assert_eq!(summary.reason, StopReason::StopRequested);
        assert_eq!(summary.frames_processed, 3);
    }

    #[test]
    fn invalid_config_is_rejected_before_start() {
        let mut config = PipelineConfig::default();
        config.inference.confidence_threshold = -0.1;
        let result = Pipeline::new(
            config,
            Box::new(MemorySource::solid(1, 8, 8).unwrap()),
            Box::new(StubBackend::new()),
        );
        let err = match result {
            Ok(_) => panic!("config should be rejected"),
            Err(err) => err,
        };
        assert_eq!(PipelineError::kind_of(&err), Some(FaultKind::ConfigError));
    }
}
