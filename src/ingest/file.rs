//! Local file frame source.
//!
//! This module provides `FileSource` for ingesting frames from stored video.
//! The file source is responsible for:
//! - Reading frames from a local video file (no network access)
//! - Decoding video frames in-memory to packed RGB24
//! - Numbering frames in delivery order
//! - Reporting a clean end of stream when the file runs out
//!
//! `stub://` paths produce a deterministic synthetic clip instead, configured with
//! query parameters: `stub://road?frames=120&width=640&height=360&fps=25&seed=7`.

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{FrameSource, SourceInfo};
#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use crate::frame::Frame;

const DEFAULT_STUB_FRAMES: u64 = 150;
const DEFAULT_STUB_WIDTH: u32 = 640;
const DEFAULT_STUB_HEIGHT: u32 = 360;
const DEFAULT_STUB_FPS: f64 = 25.0;
const STUB_VEHICLES: usize = 5;

/// Configuration for a local file source.
#[derive(Clone, Debug)]
pub struct FileConfig {
    /// Local file path (e.g., "/data/traffic/junction.mp4") or a `stub://` clip.
    pub path: String,
    /// Stop after this many frames even if the file has more.
    pub max_frames: Option<u64>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            max_frames: None,
        }
    }
}

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
    max_frames: Option<u64>,
    delivered: u64,
}

enum FileBackend {
    Synthetic(SyntheticFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes), got '{}'",
                config.path
            ));
        }
        let max_frames = config.max_frames;
        let backend = if config.path.starts_with("stub://") {
            FileBackend::Synthetic(SyntheticFileSource::new(&config.path)?)
        } else {
            #[cfg(feature = "ingest-file-ffmpeg")]
            {
                FileBackend::Ffmpeg(FfmpegFileSource::new(config)?)
            }
            #[cfg(not(feature = "ingest-file-ffmpeg"))]
            {
                return Err(anyhow!(
                    "file ingestion requires the ingest-file-ffmpeg feature"
                ));
            }
        };
        Ok(Self {
            backend,
            max_frames,
            delivered: 0,
        })
    }

    /// Number of frames handed out so far.
    pub fn frames_delivered(&self) -> u64 {
        self.delivered
    }
}

impl FrameSource for FileSource {
    fn connect(&mut self) -> Result<SourceInfo> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.max_frames.is_some_and(|max| self.delivered >= max) {
            return Ok(None);
        }
        let frame = match &mut self.backend {
            FileBackend::Synthetic(source) => source.next_frame()?,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame()?,
        };
        if frame.is_some() {
            self.delivered += 1;
        }
        Ok(frame)
    }

    fn release(&mut self) {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.release(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.release(),
        }
    }

    fn describe(&self) -> String {
        match &self.backend {
            FileBackend::Synthetic(source) => format!("{} (synthetic)", source.path),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => format!("{} (ffmpeg)", source.path()),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests and demos
// ----------------------------------------------------------------------------

struct Vehicle {
    x: f32,
    y: f32,
    w: u32,
    h: u32,
    speed: f32,
    color: [u8; 3],
}

struct SyntheticFileSource {
    path: String,
    frames: u64,
    width: u32,
    height: u32,
    fps: f64,
    frame_count: u64,
    vehicles: Vec<Vehicle>,
    released: bool,
}

impl SyntheticFileSource {
    fn new(path: &str) -> Result<Self> {
        let mut frames = DEFAULT_STUB_FRAMES;
        let mut width = DEFAULT_STUB_WIDTH;
        let mut height = DEFAULT_STUB_HEIGHT;
        let mut fps = DEFAULT_STUB_FPS;
        let mut seed = 0u64;

        if let Some((_, query)) = path.split_once('?') {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow!("malformed stub parameter '{}'", pair))?;
                let bad = || format!("invalid value '{}' for stub parameter '{}'", value, key);
                match key {
                    "frames" => frames = value.parse().with_context(bad)?,
                    "width" => width = value.parse().with_context(bad)?,
                    "height" => height = value.parse().with_context(bad)?,
                    "fps" => fps = value.parse().with_context(bad)?,
                    "seed" => seed = value.parse().with_context(bad)?,
                    other => return Err(anyhow!("unknown stub parameter '{}'", other)),
                }
            }
        }
        if width < 16 || height < 16 {
            return Err(anyhow!("stub clip must be at least 16x16, got {}x{}", width, height));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let vehicles = (0..STUB_VEHICLES)
            .map(|lane| {
                let lane_height = height / STUB_VEHICLES as u32;
                Vehicle {
                    x: rng.gen_range(0.0..width as f32),
                    y: (lane as u32 * lane_height) as f32,
                    w: rng.gen_range(width / 16..=width / 6),
                    h: (lane_height * 2 / 3).max(1),
                    speed: rng.gen_range(1.0..6.0),
                    color: [rng.gen(), rng.gen(), rng.gen()],
                }
            })
            .collect();

        Ok(Self {
            path: path.to_string(),
            frames,
            width,
            height,
            fps,
            frame_count: 0,
            vehicles,
            released: false,
        })
    }

    fn connect(&mut self) -> Result<SourceInfo> {
        log::info!("FileSource: connected to {} (synthetic)", self.path);
        Ok(SourceInfo {
            width: self.width,
            height: self.height,
            frame_rate: Some(self.fps),
        })
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.released || self.frame_count >= self.frames {
            return Ok(None);
        }
        let seq = self.frame_count;
        let pixels = self.render_scene();
        self.frame_count += 1;
        for vehicle in &mut self.vehicles {
            vehicle.x = (vehicle.x + vehicle.speed) % self.width as f32;
        }
        Frame::new(seq, self.width, self.height, pixels).map(Some)
    }

    fn render_scene(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut pixels = vec![48u8; w * h * 3];
        for vehicle in &self.vehicles {
            let x0 = vehicle.x as usize;
            let y0 = vehicle.y as usize;
            for y in y0..(y0 + vehicle.h as usize).min(h) {
                for dx in 0..vehicle.w as usize {
                    // Wrap around the right edge.
                    let x = (x0 + dx) % w;
                    let idx = (y * w + x) * 3;
                    pixels[idx..idx + 3].copy_from_slice(&vehicle.color);
                }
            }
        }
        pixels
    }

    fn release(&mut self) {
        self.released = true;
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}
