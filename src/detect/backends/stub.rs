use anyhow::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::detect::backend::{DetectionCapability, DetectorBackend, InferenceParams};
use crate::detect::result::{BoundingBox, Detection, DetectionSet};
use crate::frame::InferenceView;

const MAX_STUB_DETECTIONS: usize = 4;
const BYTES_PER_DETECTION: usize = 6;

/// Stub backend for testing and demos.
///
/// Derives up to four detections from a hash of the pixels, so identical frames
/// always yield identical detections. With `persist_tracking`, a `(category, slot)`
/// pair keeps the same track id for the lifetime of the backend.
pub struct StubBackend {
    num_classes: u8,
    tracks: HashMap<(i64, usize), u64>,
    next_track_id: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::with_classes(11)
    }

    /// Emit category ids in `0..num_classes`.
    pub fn with_classes(num_classes: u8) -> Self {
        Self {
            num_classes: num_classes.max(1),
            tracks: HashMap::new(),
            next_track_id: 1,
        }
    }

    fn assign_track(&mut self, persist: bool, key: (i64, usize)) -> u64 {
        if persist {
            if let Some(id) = self.tracks.get(&key) {
                return *id;
            }
        }
        let id = self.next_track_id;
        self.next_track_id += 1;
        if persist {
            self.tracks.insert(key, id);
        }
        id
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(
            capability,
            DetectionCapability::ObjectDetection | DetectionCapability::Tracking
        )
    }

    fn infer(
        &mut self,
        view: &InferenceView<'_>,
        params: &InferenceParams,
    ) -> Result<DetectionSet> {
        let digest: [u8; 32] = Sha256::digest(view.pixels()).into();
        let count = digest[0] as usize % (MAX_STUB_DETECTIONS + 1);
        let width = view.width() as f32;
        let height = view.height() as f32;

        let mut detections = Vec::with_capacity(count);
        for slot in 0..count {
            let b = &digest[1 + slot * BYTES_PER_DETECTION..1 + (slot + 1) * BYTES_PER_DETECTION];
            let category_id = (b[0] % self.num_classes) as i64;
            let confidence = 0.3 + (b[1] as f32 / 255.0) * 0.7;
            let cx = b[2] as f32 / 255.0 * width;
            let cy = b[3] as f32 / 255.0 * height;
            let half_w = (0.05 + b[4] as f32 / 255.0 * 0.15) * width;
            let half_h = (0.05 + b[5] as f32 / 255.0 * 0.15) * height;
            let bbox = BoundingBox::from_corners(cx - half_w, cy - half_h, cx + half_w, cy + half_h)
                .clamped(view.width(), view.height());
            let track_id = self.assign_track(params.persist_tracking, (category_id, slot));
            detections.push(Detection::new(category_id, confidence, bbox).with_track(track_id));
        }

        let mut set = DetectionSet::new(detections);
        set.retain_confident(params.confidence_threshold);
        Ok(set)
    }

    fn reset_tracking(&mut self) {
        self.tracks.clear();
        self.next_track_id = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn params(persist: bool) -> InferenceParams {
        InferenceParams {
            persist_tracking: persist,
            confidence_threshold: 0.0,
            resolution: 320,
        }
    }

    fn busy_frame() -> Frame {
        // Pick a fill whose hash yields at least one detection.
        (0u8..=255)
            .map(|v| Frame::filled(0, 64, 48, [v, v.wrapping_mul(3), 7]).unwrap())
            .find(|f| Sha256::digest(f.pixels())[0] as usize % (MAX_STUB_DETECTIONS + 1) > 0)
            .expect("some fill produces detections")
    }

    #[test]
    fn stub_backend_is_deterministic_per_frame() {
        let frame = busy_frame();
        let mut a = StubBackend::new();
        let mut b = StubBackend::new();
        let ra = a.infer(&frame.inference_view(), &params(true)).unwrap();
        let rb = b.infer(&frame.inference_view(), &params(true)).unwrap();
        assert_eq!(ra, rb);
        assert!(!ra.is_empty());
        for det in &ra {
            assert!((0..11).contains(&det.category_id));
            assert!(det.bbox.x2 <= 64.0 && det.bbox.y2 <= 48.0);
        }
    }

    #[test]
    fn persisted_tracks_keep_their_ids() {
        let frame = busy_frame();
        let mut backend = StubBackend::new();
        let first = backend.infer(&frame.inference_view(), &params(true)).unwrap();
        let second = backend.infer(&frame.inference_view(), &params(true)).unwrap();
        let ids = |set: &DetectionSet| set.iter().map(|d| d.track_id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn unpersisted_tracks_get_fresh_ids() {
        let frame = busy_frame();
        let mut backend = StubBackend::new();
        let first = backend.infer(&frame.inference_view(), &params(false)).unwrap();
        let second = backend.infer(&frame.inference_view(), &params(false)).unwrap();
        let first_ids: Vec<_> = first.iter().map(|d| d.track_id).collect();
        let second_ids: Vec<_> = second.iter().map(|d| d.track_id).collect();
        assert_ne!(first_ids, second_ids);
    }

    #[test]
    fn threshold_drops_everything_above_one() {
        let frame = busy_frame();
        let mut backend = StubBackend::new();
        let strict = InferenceParams {
            confidence_threshold: 1.01,
            ..params(true)
        };
        assert!(backend.infer(&frame.inference_view(), &strict).unwrap().is_empty());
    }
}
