use anyhow::Result;

use crate::detect::result::DetectionSet;
use crate::frame::InferenceView;

/// Detection capabilities supported by backends.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    ObjectDetection,
    /// Assigns track ids that stay stable across calls.
    Tracking,
}

/// Per-call inference settings. Constant for a run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InferenceParams {
    /// Keep tracker state between calls so track ids stay stable.
    pub persist_tracking: bool,
    /// Detections below this confidence are dropped by the backend.
    pub confidence_threshold: f32,
    /// Square model input size in pixels.
    pub resolution: u32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            persist_tracking: true,
            confidence_threshold: 0.25,
            resolution: 320,
        }
    }
}

/// Detector backend trait.
///
/// The pipeline treats a backend as an opaque, possibly slow, blocking call.
/// An `Err` from `infer` means the backend could not process the frame; the
/// pipeline ends the run on it.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Run detection on a frame.
    ///
    /// Implementations must treat the pixel slice as read-only and must not keep it.
    fn infer(&mut self, view: &InferenceView<'_>, params: &InferenceParams)
        -> Result<DetectionSet>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Forget tracker state. Called at run start.
    fn reset_tracking(&mut self) {}
}
