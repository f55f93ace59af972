//! MP4 output through FFmpeg.
//!
//! Frames are converted from RGB24 to YUV420P and encoded as MPEG-4 Part 2.
//! Presentation timestamps are frame indices in a `1/fps` time base.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg::util::format::pixel::Pixel;
use ffmpeg::Rational;

use super::{OutputSink, OutputSpec};
use crate::frame::{Frame, BYTES_PER_PIXEL};

pub struct FfmpegSink {
    spec: OutputSpec,
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    encoder_time_base: Rational,
    frames: u64,
    finished: bool,
}

impl FfmpegSink {
    pub fn create(spec: &OutputSpec) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        if let Some(parent) = spec.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create output directory {}", parent.display()))?;
        }
        let mut output = ffmpeg::format::output(&spec.path)
            .with_context(|| format!("open output container {}", spec.path.display()))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| anyhow!("MPEG-4 encoder not available in this ffmpeg build"))?;
        let fps = spec.frame_rate.round().max(1.0) as i32;
        let encoder_time_base = Rational::new(1, fps);

        let mut stream = output.add_stream(codec).context("add video stream")?;
        let stream_index = stream.index();
        let mut video = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create video encoder")?;
        video.set_width(spec.width);
        video.set_height(spec.height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(encoder_time_base);
        video.set_frame_rate(Some(Rational::new(fps, 1)));
        if global_header {
            video.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = video.open_as(codec).context("open MPEG-4 encoder")?;
        stream.set_parameters(&encoder);
        stream.set_time_base(encoder_time_base);

        output.write_header().context("write container header")?;

        let scaler = ffmpeg::software::scaling::Context::get(
            Pixel::RGB24,
            spec.width,
            spec.height,
            Pixel::YUV420P,
            spec.width,
            spec.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "FfmpegSink: writing {}x{} @ {} fps to {}",
            spec.width,
            spec.height,
            fps,
            spec.path.display()
        );
        Ok(Self {
            spec: spec.clone(),
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base,
            frames: 0,
            finished: false,
        })
    }

    fn drain_packets(&mut self) -> Result<()> {
        let stream_time_base = self
            .output
            .stream(self.stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| anyhow!("output stream {} missing", self.stream_index))?;
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .context("write encoded packet")?;
        }
        Ok(())
    }
}

impl OutputSink for FfmpegSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.finished {
            return Err(anyhow!("output stream already closed"));
        }
        self.spec.check_frame(frame)?;

        let mut rgb = ffmpeg::frame::Video::new(Pixel::RGB24, self.spec.width, self.spec.height);
        let row_bytes = self.spec.width as usize * BYTES_PER_PIXEL;
        let stride = rgb.stride(0);
        let plane = rgb.data_mut(0);
        for (y, row) in frame.pixels().chunks_exact(row_bytes).enumerate() {
            let start = y * stride;
            let dest = plane
                .get_mut(start..start + row_bytes)
                .ok_or_else(|| anyhow!("ffmpeg frame plane shorter than expected"))?;
            dest.copy_from_slice(row);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler.run(&rgb, &mut yuv).context("convert RGB24 to YUV420P")?;
        yuv.set_pts(Some(self.frames as i64));
        self.encoder
            .send_frame(&yuv)
            .with_context(|| format!("encode frame {}", frame.seq))?;
        self.drain_packets()?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.encoder.send_eof().context("flush encoder")?;
        self.drain_packets()?;
        self.output.write_trailer().context("write container trailer")?;
        log::info!(
            "FfmpegSink: closed {} after {} frames",
            self.spec.path.display(),
            self.frames
        );
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }
}
