//! Traffic Monitor
//!
//! This crate implements a frame-skipping detection pipeline for stored video.
//!
//! # Architecture
//!
//! Each run pulls frames from a source one at a time and, per frame:
//!
//! 1. **Schedule**: decide whether the frame gets full inference or reuses the last result.
//! 2. **Detect**: run the (slow, opaque) detector on scheduled frames only.
//! 3. **Count**: turn detections into a per-category count snapshot.
//! 4. **Cache**: keep the freshest annotated frame + counts for skipped frames.
//! 5. **Persist**: append exactly one frame to the output stream per input frame.
//! 6. **Measure**: update a smoothed throughput rate and sample host sensors.
//! 7. **Present**: hand the frame, counts, and metrics to a presenter.
//!
//! # Module Structure
//!
//! - `frame`: Immutable frames and annotated frames (shared, never copied on reuse)
//! - `ingest`: Frame sources (in-memory, synthetic clips, local files)
//! - `detect`: Detector backends and the backend registry
//! - `scheduler`, `cache`, `counts`, `metrics`, `resources`, `sink`: pipeline stages
//! - `pipeline`: The driver state machine (Idle -> Running -> Stopped)
//! - `present`, `render`, `ui`: Presentation collaborators
//! - Core types: `FaultKind`, `PipelineError`

pub mod cache;
pub mod config;
pub mod counts;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod present;
pub mod render;
pub mod resources;
pub mod scheduler;
pub mod sink;
pub mod ui;

pub use cache::AnnotationCache;
pub use config::{MonitorConfig, OutputTarget, PipelineConfig};
pub use counts::{aggregate, aggregate_with, Categories, CountPolicy, CountSnapshot, TrackTally};
pub use detect::{
    BackendRegistry, BoundingBox, Detection, DetectionCapability, DetectionSet, DetectorBackend,
    InferenceParams, StubBackend,
};
pub use frame::{AnnotatedFrame, Frame, InferenceView};
pub use ingest::{file::FileConfig, FileSource, FrameSource, MemorySource, SourceInfo};
pub use metrics::{Clock, ManualClock, RateTracker, SteppingClock, SystemClock, SMOOTHING_ALPHA};
pub use pipeline::{
    Persistence, Phase, Pipeline, PipelineSnapshot, PipelineState, RunSummary, SnapshotBoard,
    StepOutcome, StopHandle, StopReason,
};
pub use present::{FrameReport, NullPresenter, Presenter};
pub use render::{BoxAnnotator, FrameAnnotator};
pub use resources::{GpuReading, ResourceMonitor, ResourceReading};
pub use scheduler::{should_infer, Decision, Scheduler};
pub use sink::{FileSinkOpener, OutputFormat, OutputSink, OutputSpec, RawVideoSink, SinkOpener};

// -------------------- Fault Taxonomy --------------------

/// Classes of conditions a run can hit.
///
/// Only `ModelError` and `ConfigError` ever end a run early; the rest are
/// absorbed and reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Frame source ran out of frames. Normal termination.
    SourceExhausted,
    /// Output stream could not be created or written. Persistence is disabled.
    OpenError,
    /// Detector failed on a frame. Fatal for the run.
    ModelError,
    /// Host/device counters could not be read. Display degrades.
    SensorUnavailable,
    /// Static configuration is invalid. Rejected before the run starts.
    ConfigError,
}

impl FaultKind {
    pub fn code(self) -> &'static str {
        match self {
            FaultKind::SourceExhausted => "SOURCE_EXHAUSTED",
            FaultKind::OpenError => "OPEN_ERROR",
            FaultKind::ModelError => "MODEL_ERROR",
            FaultKind::SensorUnavailable => "SENSOR_UNAVAILABLE",
            FaultKind::ConfigError => "CONFIG_ERROR",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineError {
    pub kind: FaultKind,
    pub message: String,
}

impl PipelineError {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ConfigError, message)
    }

    pub fn model(message: impl Into<String>) -> Self {
        Self::new(FaultKind::ModelError, message)
    }

    pub fn open(message: impl Into<String>) -> Self {
        Self::new(FaultKind::OpenError, message)
    }

    /// Fault kind of an `anyhow::Error`, if it carries a `PipelineError`.
    pub fn kind_of(err: &anyhow::Error) -> Option<FaultKind> {
        err.downcast_ref::<PipelineError>().map(|e| e.kind)
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for PipelineError {}
