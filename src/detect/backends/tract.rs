#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops::FilterType, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectionCapability, DetectorBackend, InferenceParams};
use crate::detect::result::{BoundingBox, Detection, DetectionSet};
use crate::frame::InferenceView;

const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based backend for YOLO-style ONNX detectors.
///
/// Expects a single output shaped `[1, 4 + classes, anchors]` with rows
/// `cx, cy, w, h, score_0 .. score_n` in input pixel units. No tracking.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    resolution: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk for a square `resolution x resolution` input.
    pub fn new<P: AsRef<Path>>(model_path: P, resolution: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = resolution as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, resolution })
    }

    fn build_input(&self, view: &InferenceView<'_>) -> Result<Tensor> {
        let image = RgbImage::from_raw(view.width(), view.height(), view.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", view.width(), view.height()))?;
        let resized =
            image::imageops::resize(&image, self.resolution, self.resolution, FilterType::Triangle);
        let side = self.resolution as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        view: &InferenceView<'_>,
        threshold: f32,
    ) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape();
        if shape.len() != 3 || shape[1] < 5 {
            return Err(anyhow!("unexpected output shape {:?}", shape));
        }
        let classes = shape[1] - 4;
        let anchors = shape[2];
        let sx = view.width() as f32 / self.resolution as f32;
        let sy = view.height() as f32 / self.resolution as f32;

        let mut candidates = Vec::new();
        for a in 0..anchors {
            let (best_class, best_score) = (0..classes)
                .map(|c| (c, preds[[0, 4 + c, a]]))
                .fold((0, f32::NEG_INFINITY), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
            if !best_score.is_finite() || best_score < threshold {
                continue;
            }
            let cx = preds[[0, 0, a]] * sx;
            let cy = preds[[0, 1, a]] * sy;
            let hw = preds[[0, 2, a]] * sx / 2.0;
            let hh = preds[[0, 3, a]] * sy / 2.0;
            let bbox = BoundingBox::from_corners(cx - hw, cy - hh, cx + hw, cy + hh)
                .clamped(view.width(), view.height());
            candidates.push(Detection::new(best_class as i64, best_score.min(1.0), bbox));
        }
        Ok(non_max_suppression(candidates, NMS_IOU_THRESHOLD))
    }
}

/// Greedy per-class NMS, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for cand in candidates {
        let overlaps = kept.iter().any(|k| {
            k.category_id == cand.category_id && k.bbox.iou(&cand.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(cand);
        }
    }
    kept
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn infer(
        &mut self,
        view: &InferenceView<'_>,
        params: &InferenceParams,
    ) -> Result<DetectionSet> {
        let input = self.build_input(view)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let detections = self.decode(outputs, view, params.confidence_threshold)?;
        Ok(DetectionSet::new(detections))
    }
}
