//! Local file frame source using FFmpeg.
//!
//! Decodes the best video stream of a local file to packed RGB24, in memory.
//! Buffered decoder output is drained before more packets are read, and the
//! decoder is flushed at end of file so trailing frames are not lost.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;

use super::file::FileConfig;
use super::SourceInfo;
use crate::frame::Frame;

#[derive(Debug, PartialEq, Eq)]
enum Received {
    Frame,
    NeedInput,
    Drained,
}

/// EAGAIN and EOF are decoder states; any other error is a decode failure.
fn classify_receive(result: Result<(), ffmpeg::Error>) -> Result<Received> {
    match result {
        Ok(()) => Ok(Received::Frame),
        Err(ffmpeg::Error::Eof) => Ok(Received::Drained),
        Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
            Ok(Received::NeedInput)
        }
        Err(err) => Err(err).context("receive frame from ffmpeg decoder"),
    }
}

pub(crate) struct FfmpegFileSource {
    config: FileConfig,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    frame_rate: Option<f64>,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_count: u64,
    eof_sent: bool,
    released: bool,
}

impl FfmpegFileSource {
    pub(crate) fn new(config: FileConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&config.path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", config.path))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let rate = input_stream.avg_frame_rate();
        let frame_rate = (rate.numerator() > 0 && rate.denominator() > 0)
            .then(|| rate.numerator() as f64 / rate.denominator() as f64);
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            config,
            input,
            stream_index,
            frame_rate,
            decoder,
            scaler,
            frame_count: 0,
            eof_sent: false,
            released: false,
        })
    }

    pub(crate) fn path(&self) -> &str {
        &self.config.path
    }

    pub(crate) fn connect(&mut self) -> Result<SourceInfo> {
        log::info!("FileSource: connected to {} (ffmpeg)", self.config.path);
        Ok(SourceInfo {
            width: self.decoder.width(),
            height: self.decoder.height(),
            frame_rate: self.frame_rate,
        })
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Ok(None);
        }
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            match classify_receive(self.decoder.receive_frame(&mut decoded))? {
                Received::Frame => return self.convert(&decoded).map(Some),
                Received::Drained => return Ok(None),
                Received::NeedInput if self.eof_sent => return Ok(None),
                Received::NeedInput => {}
            }
            let next = self.input.packets().next();
            match next {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }

    pub(crate) fn release(&mut self) {
        if !self.released {
            log::debug!(
                "FileSource: released {} after {} frames",
                self.config.path,
                self.frame_count
            );
        }
        self.released = true;
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        let seq = self.frame_count;
        self.frame_count += 1;
        Frame::new(seq, width, height, pixels)
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let pixels = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
