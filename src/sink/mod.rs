//! Output sinks.
//!
//! Every input frame produces exactly one output frame, inferred or reused, in
//! input order. Sinks are append-only and strictly sequential.
//!
//! - `RawVideoSink`: headerless RGB24 stream plus a JSON sidecar (always available)
//! - `FfmpegSink`: MPEG-4 video in an MP4 container (feature: output-ffmpeg)

#[cfg(feature = "output-ffmpeg")]
mod ffmpeg;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::frame::Frame;
use crate::PipelineError;

#[cfg(feature = "output-ffmpeg")]
pub use self::ffmpeg::FfmpegSink;

/// Frame rate used when neither the config nor the source declares one.
pub const FALLBACK_FRAME_RATE: f64 = 25.0;

/// Container written by `FileSinkOpener`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Raw,
    Mp4,
}

impl OutputFormat {
    /// File extension conventionally used for the format.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Raw => "rgb",
            OutputFormat::Mp4 => "mp4",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" | "rgb24" => Ok(OutputFormat::Raw),
            "mp4" => Ok(OutputFormat::Mp4),
            other => Err(anyhow!("unknown output format '{}' (expected raw or mp4)", other)),
        }
    }
}

/// Where and how to write the annotated stream.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputSpec {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub format: OutputFormat,
}

impl OutputSpec {
    fn check_frame(&self, frame: &Frame) -> Result<()> {
        if frame.width != self.width || frame.height != self.height {
            return Err(anyhow!(
                "frame {} is {}x{}, output stream is {}x{}",
                frame.seq,
                frame.width,
                frame.height,
                self.width,
                self.height
            ));
        }
        Ok(())
    }
}

pub trait OutputSink {
    /// Append one frame.
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. A second call does nothing.
    fn finish(&mut self) -> Result<()>;

    /// Frames accepted so far.
    fn frames_written(&self) -> u64;
}

/// Creates a sink for a run.
pub trait SinkOpener {
    fn open(&self, spec: &OutputSpec) -> Result<Box<dyn OutputSink>>;
}

impl<F> SinkOpener for F
where
    F: Fn(&OutputSpec) -> Result<Box<dyn OutputSink>>,
{
    fn open(&self, spec: &OutputSpec) -> Result<Box<dyn OutputSink>> {
        self(spec)
    }
}

/// Opens file-backed sinks according to `OutputSpec::format`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileSinkOpener;

impl SinkOpener for FileSinkOpener {
    fn open(&self, spec: &OutputSpec) -> Result<Box<dyn OutputSink>> {
        let sink: Result<Box<dyn OutputSink>> = match spec.format {
            OutputFormat::Raw => RawVideoSink::create(spec).map(|s| Box::new(s) as _),
            #[cfg(feature = "output-ffmpeg")]
            OutputFormat::Mp4 => FfmpegSink::create(spec).map(|s| Box::new(s) as _),
            #[cfg(not(feature = "output-ffmpeg"))]
            OutputFormat::Mp4 => Err(anyhow!(
                "mp4 output requires building with the output-ffmpeg feature"
            )),
        };
        sink.map_err(|e| {
            PipelineError::open(format!("{}: {:#}", spec.path.display(), e)).into()
        })
    }
}

// ----------------------------------------------------------------------------
// Raw RGB24 sink
// ----------------------------------------------------------------------------

/// Sidecar metadata describing a raw stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSidecar {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub pixel_format: String,
    pub frames: u64,
}

/// Path of the sidecar written next to a raw stream.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// Appends packed RGB24 frames to a file. `<path>.json` describes the stream.
pub struct RawVideoSink {
    spec: OutputSpec,
    writer: Option<BufWriter<File>>,
    frames: u64,
}

impl RawVideoSink {
    pub fn create(spec: &OutputSpec) -> Result<Self> {
        if spec.width == 0 || spec.height == 0 {
            return Err(anyhow!(
                "output dimensions must be non-zero ({}x{})",
                spec.width,
                spec.height
            ));
        }
        if let Some(parent) = spec.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create output directory {}", parent.display()))?;
        }
        let file = File::create(&spec.path)
            .with_context(|| format!("create output file {}", spec.path.display()))?;
        log::info!(
            "RawVideoSink: writing {}x{} @ {:.2} fps to {}",
            spec.width,
            spec.height,
            spec.frame_rate,
            spec.path.display()
        );
        Ok(Self {
            spec: spec.clone(),
            writer: Some(BufWriter::new(file)),
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.spec.path
    }
}

impl OutputSink for RawVideoSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("output stream already closed"))?;
        self.spec.check_frame(frame)?;
        writer
            .write_all(frame.pixels())
            .with_context(|| format!("write frame {}", frame.seq))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush().context("flush raw output")?;
        let sidecar = RawSidecar {
            width: self.spec.width,
            height: self.spec.height,
            frame_rate: self.spec.frame_rate,
            pixel_format: "rgb24".to_string(),
            frames: self.frames,
        };
        let path = sidecar_path(&self.spec.path);
        let json = serde_json::to_vec_pretty(&sidecar)?;
        std::fs::write(&path, json)
            .with_context(|| format!("write sidecar {}", path.display()))?;
        log::info!(
            "RawVideoSink: closed {} after {} frames",
            self.spec.path.display(),
            self.frames
        );
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }
}

impl Drop for RawVideoSink {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            log::warn!("RawVideoSink: close on drop failed: {:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FaultKind;

    fn spec(dir: &Path, name: &str) -> OutputSpec {
        OutputSpec {
            path: dir.join(name),
            width: 4,
            height: 2,
            frame_rate: 25.0,
            format: OutputFormat::Raw,
        }
    }

    #[test]
    fn raw_sink_appends_frames_and_writes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec(dir.path(), "out.rgb");
        let mut sink = RawVideoSink::create(&spec).unwrap();
        for seq in 0..3 {
            sink.write(&Frame::filled(seq, 4, 2, [seq as u8, 0, 0]).unwrap())
                .unwrap();
        }
        sink.finish().unwrap();
        sink.finish().unwrap();

        let bytes = std::fs::read(&spec.path).unwrap();
        assert_eq!(bytes.len(), 3 * 4 * 2 * 3);
        assert_eq!(bytes[4 * 2 * 3], 1);
        let sidecar: RawSidecar =
            serde_json::from_slice(&std::fs::read(sidecar_path(&spec.path)).unwrap()).unwrap();
        assert_eq!(sidecar.frames, 3);
        assert_eq!(sidecar.pixel_format, "rgb24");
        assert_eq!((sidecar.width, sidecar.height), (4, 2));
    }

    #[test]
    fn raw_sink_rejects_mismatched_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawVideoSink::create(&spec(dir.path(), "out.rgb")).unwrap();
        let wrong = Frame::filled(0, 2, 2, [0, 0, 0]).unwrap();
        assert!(sink.write(&wrong).is_err());
        assert_eq!(sink.frames_written(), 0);
    }

    #[test]
    fn write_after_finish_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawVideoSink::create(&spec(dir.path(), "out.rgb")).unwrap();
        sink.finish().unwrap();
        assert!(sink.write(&Frame::filled(0, 4, 2, [0, 0, 0]).unwrap()).is_err());
    }

    #[test]
    fn opener_reports_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();
        let spec = spec(&blocker, "out.rgb");
        let err = match FileSinkOpener.open(&spec) {
            Ok(_) => panic!("open should fail under a regular file"),
            Err(err) => err,
        };
        assert_eq!(PipelineError::kind_of(&err), Some(FaultKind::OpenError));
    }

    #[test]
    fn closures_act_as_openers() {
        let opener = |_: &OutputSpec| -> Result<Box<dyn OutputSink>> { Err(anyhow!("no disk")) };
        let dir = tempfile::tempdir().unwrap();
        assert!(opener.open(&spec(dir.path(), "x.rgb")).is_err());
    }

    #[test]
    fn output_format_parses_names() {
        assert_eq!("MP4".parse::<OutputFormat>().unwrap(), OutputFormat::Mp4);
        assert_eq!("raw".parse::<OutputFormat>().unwrap(), OutputFormat::Raw);
        assert!("avi".parse::<OutputFormat>().is_err());
    }
}
