use serde::Serialize;

/// Axis-aligned box in frame pixel coordinates (`x1 <= x2`, `y1 <= y2`).
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// Build from two corners in any order.
    pub fn from_corners(ax: f32, ay: f32, bx: f32, by: f32) -> Self {
        Self {
            x1: ax.min(bx),
            y1: ay.min(by),
            x2: ax.max(bx),
            y2: ay.max(by),
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamp to a `width x height` frame.
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let w = width as f32;
        let h = height as f32;
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }
}

/// One detected object.
///
/// `category_id` is whatever the model emitted; it is not guaranteed to index the
/// configured category list.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub category_id: i64,
    /// 0..=1
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Stable identity assigned by a tracking detector.
    pub track_id: Option<u64>,
}

impl Detection {
    pub fn new(category_id: i64, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            category_id,
            confidence,
            bbox,
            track_id: None,
        }
    }

    pub fn with_track(mut self, track_id: u64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    /// `category_id` as an index into a list of `len` categories, if valid.
    pub fn category_index(&self, len: usize) -> Option<usize> {
        usize::try_from(self.category_id).ok().filter(|idx| *idx < len)
    }
}

/// Ordered detections from a single inference call.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionSet {
    detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
        self.detections.iter()
    }

    /// Drop detections below `threshold`.
    pub fn retain_confident(&mut self, threshold: f32) {
        self.detections.retain(|d| d.confidence >= threshold);
    }
}

impl From<Vec<Detection>> for DetectionSet {
    fn from(detections: Vec<Detection>) -> Self {
        Self::new(detections)
    }
}

impl<'a> IntoIterator for &'a DetectionSet {
    type Item = &'a Detection;
    type IntoIter = std::slice::Iter<'a, Detection>;

    fn into_iter(self) -> Self::IntoIter {
        self.detections.iter()
    }
}
