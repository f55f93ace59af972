//! Overlay rendering.
//!
//! Turns an inferred frame plus its detections into an `AnnotatedFrame`. The input
//! frame is never modified; the overlay is drawn on a copy.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::DetectionSet;
use crate::frame::{AnnotatedFrame, Frame};

/// Produces the annotated frame for an inference step.
pub trait FrameAnnotator {
    fn annotate(&self, frame: &Frame, detections: DetectionSet) -> Result<AnnotatedFrame>;
}

const PALETTE: [[u8; 3]; 8] = [
    [0, 255, 0],
    [255, 64, 64],
    [64, 128, 255],
    [255, 255, 0],
    [255, 0, 255],
    [0, 255, 255],
    [255, 160, 0],
    [160, 96, 255],
];

/// Draws a hollow box per detection, colored by category, with a small filled
/// tag at the top-left corner.
#[derive(Clone, Copy, Debug)]
pub struct BoxAnnotator {
    thickness: u32,
}

impl BoxAnnotator {
    pub fn new(thickness: u32) -> Self {
        Self {
            thickness: thickness.max(1),
        }
    }

    pub fn color_for(category_id: i64) -> Rgb<u8> {
        let idx = category_id.rem_euclid(PALETTE.len() as i64) as usize;
        Rgb(PALETTE[idx])
    }
}

impl Default for BoxAnnotator {
    fn default() -> Self {
        Self::new(2)
    }
}

impl FrameAnnotator for BoxAnnotator {
    fn annotate(&self, frame: &Frame, detections: DetectionSet) -> Result<AnnotatedFrame> {
        let mut img = RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
            .ok_or_else(|| anyhow!("frame {} buffer does not match its size", frame.seq))?;

        for det in &detections {
            let bbox = det.bbox.clamped(frame.width, frame.height);
            let w = bbox.width() as u32;
            let h = bbox.height() as u32;
            if w == 0 || h == 0 {
                continue;
            }
            let color = Self::color_for(det.category_id);
            let (x, y) = (bbox.x1 as i32, bbox.y1 as i32);
            for inset in 0..self.thickness.min(w / 2).min(h / 2).max(1) {
                let rect = Rect::at(x + inset as i32, y + inset as i32)
                    .of_size(w - 2 * inset, h - 2 * inset);
                draw_hollow_rect_mut(&mut img, rect, color);
            }
            let tag = (self.thickness * 3).min(w).min(h).max(1);
            draw_filled_rect_mut(&mut img, Rect::at(x, y).of_size(tag, tag), color);
        }

        let rendered = Frame::new(frame.seq, frame.width, frame.height, img.into_raw())?;
        Ok(AnnotatedFrame::new(rendered, frame.seq, detections))
    }
}
