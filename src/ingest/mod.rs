//! Frame ingestion sources.
//!
//! This module provides sources for frames:
//! - Local video files (feature: ingest-file-ffmpeg)
//! - Synthetic `stub://` clips (testing, demos)
//! - In-memory frame lists (hosts that decode frames themselves, tests)
//!
//! Every source is sequential and finite. `next_frame` returning `Ok(None)` means
//! end of stream, which ends a run normally. Sources assign sequence numbers
//! starting at 0 in delivery order.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;

use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::frame::Frame;

pub use file::FileSource;

/// Stream properties reported when a source connects.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Native frame rate, when the container declares one.
    pub frame_rate: Option<f64>,
}

/// Sequential supplier of frames.
pub trait FrameSource {
    /// Open the underlying stream. Called once at run start.
    fn connect(&mut self) -> Result<SourceInfo>;

    /// Next frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying stream. Safe to call more than once.
    fn release(&mut self) {}

    /// Human-readable origin for logs.
    fn describe(&self) -> String;
}

// ----------------------------------------------------------------------------
// In-memory source
// ----------------------------------------------------------------------------

/// Source backed by frames already in memory.
pub struct MemorySource {
    frames: VecDeque<Frame>,
    info: SourceInfo,
    delivered: u64,
}

impl MemorySource {
    /// All frames must share the dimensions of the first one.
    pub fn new(frames: Vec<Frame>, frame_rate: Option<f64>) -> Result<Self> {
        let first = frames
            .first()
            .ok_or_else(|| anyhow!("memory source needs at least one frame"))?;
        let (width, height) = (first.width, first.height);
        if let Some(bad) = frames
            .iter()
            .find(|f| f.width != width || f.height != height)
        {
            return Err(anyhow!(
                "frame {} is {}x{}, expected {}x{}",
                bad.seq,
                bad.width,
                bad.height,
                width,
                height
            ));
        }
        Ok(Self {
            frames: frames.into(),
            info: SourceInfo {
                width,
                height,
                frame_rate,
            },
            delivered: 0,
        })
    }

    /// `count` solid frames whose color encodes the sequence number.
    pub fn solid(count: usize, width: u32, height: u32) -> Result<Self> {
        let frames = (0..count)
            .map(|i| {
                let v = (i % 256) as u8;
                Frame::filled(i as u64, width, height, [v, v.wrapping_add(85), v.wrapping_add(170)])
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(frames, Some(25.0))
    }
}

impl FrameSource for MemorySource {
    fn connect(&mut self) -> Result<SourceInfo> {
        Ok(self.info)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.delivered += 1;
        }
        Ok(frame)
    }

    fn release(&mut self) {
        self.frames.clear();
    }

    fn describe(&self) -> String {
        format!("memory ({} frames delivered)", self.delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_yields_frames_in_order_then_ends() {
        let mut source = MemorySource::solid(3, 4, 4).unwrap();
        let info = source.connect().unwrap();
        assert_eq!((info.width, info.height), (4, 4));
        let seqs: Vec<u64> = std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|f| f.seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn memory_source_rejects_mixed_dimensions() {
        let frames = vec![
            Frame::filled(0, 4, 4, [0, 0, 0]).unwrap(),
            Frame::filled(1, 8, 4, [0, 0, 0]).unwrap(),
        ];
        assert!(MemorySource::new(frames, None).is_err());
        assert!(MemorySource::new(Vec::new(), None).is_err());
    }
}
