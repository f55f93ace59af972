//! Frame types.
//!
//! - `Frame`: Immutable RGB24 pixel buffer with a source-assigned sequence number.
//! - `InferenceView`: Restricted view handed to detectors. Pixels flow in, detections flow out.
//! - `AnnotatedFrame`: A frame with detection overlays, shared via `Arc` while cached.
//!
//! Pixels live behind an `Arc<[u8]>`. Cloning a `Frame` shares the buffer and there is no
//! mutable pixel accessor, so a frame reused on skipped steps can be aliased freely.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::detect::{DetectionSet, DetectorBackend, InferenceParams};

/// Bytes per pixel for the only supported layout (packed RGB24).
pub const BYTES_PER_PIXEL: usize = 3;

// ----------------------------------------------------------------------------
// Frame: immutable pixel container
// ----------------------------------------------------------------------------

/// Immutable frame. No `&mut` access to pixels exists; clones share the buffer.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Sequence number assigned by the frame source (monotonically increasing).
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    data: Arc<[u8]>,
}

impl Frame {
    /// Create a frame from packed RGB24 pixels.
    ///
    /// Fails when the buffer does not hold exactly `width * height * 3` bytes.
    pub fn new(seq: u64, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame {} expected {} RGB bytes for {}x{}, received {}",
                seq,
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            seq,
            width,
            height,
            data: data.into(),
        })
    }

    /// Solid-color frame. Used by synthetic sources and tests.
    pub fn filled(seq: u64, width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let len = expected_len(width, height)?;
        let data = rgb.iter().copied().cycle().take(len).collect();
        Self::new(seq, width, height, data)
    }

    /// Read-only pixel access.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// True when both frames share the same pixel allocation.
    pub fn shares_pixels_with(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Detectors receive a view, not the frame itself.
    pub fn inference_view(&self) -> InferenceView<'_> {
        InferenceView { frame: self }
    }
}

fn expected_len(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(anyhow!("frame dimensions must be non-zero ({}x{})", width, height));
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(BYTES_PER_PIXEL))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// InferenceView: what detectors see
// ----------------------------------------------------------------------------

/// Restricted view of a frame for inference.
///
/// The detector gets a borrowed pixel slice for the duration of the call only.
pub struct InferenceView<'a> {
    frame: &'a Frame,
}

impl<'a> InferenceView<'a> {
    pub fn seq(&self) -> u64 {
        self.frame.seq
    }

    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    pub fn pixels(&self) -> &'a [u8] {
        self.frame.pixels()
    }

    /// Run a detector on this frame. Blocks until the detector returns.
    pub fn run_detector(
        &self,
        detector: &mut dyn DetectorBackend,
        params: &InferenceParams,
    ) -> Result<DetectionSet> {
        detector.infer(self, params)
    }
}

// ----------------------------------------------------------------------------
// AnnotatedFrame: overlay result, shared while cached
// ----------------------------------------------------------------------------

/// Frame with detection overlays.
///
/// Held as `Arc<AnnotatedFrame>` by the annotation cache; skipped steps clone the `Arc`.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    frame: Frame,
    source_seq: u64,
    detections: DetectionSet,
    annotated: bool,
}

impl AnnotatedFrame {
    /// Wrap a rendered frame produced from the frame numbered `source_seq`.
    pub fn new(frame: Frame, source_seq: u64, detections: DetectionSet) -> Self {
        Self {
            frame,
            source_seq,
            detections,
            annotated: true,
        }
    }

    /// Stand-in for a raw frame that has not been through inference.
    pub fn passthrough(frame: Frame) -> Self {
        let source_seq = frame.seq;
        Self {
            frame,
            source_seq,
            detections: DetectionSet::default(),
            annotated: false,
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Sequence number of the input frame the overlay was computed on.
    pub fn source_seq(&self) -> u64 {
        self.source_seq
    }

    pub fn detections(&self) -> &DetectionSet {
        &self.detections
    }

    /// False for pass-through frames.
    pub fn is_annotated(&self) -> bool {
        self.annotated
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
