//! Presentation adapters.
//!
//! The driver calls `Presenter::present` once per frame, after the frame has been
//! written and metrics updated. Presenters must return promptly and never fail
//! the run; anything they cannot do is logged and dropped.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;
use std::io::Write;

use crate::counts::CountSnapshot;
use crate::frame::AnnotatedFrame;
use crate::resources::ResourceReading;

/// Per-frame status handed to presenters alongside the frame and counts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FrameReport {
    /// Zero-based index of the input frame.
    pub index: u64,
    /// Sequence number of the frame the overlay came from.
    pub source_seq: u64,
    pub inferred: bool,
    /// Smoothed frames per second.
    pub rate: f64,
    pub resources: ResourceReading,
    pub frames_written: u64,
    pub persisting: bool,
}

pub trait Presenter {
    fn present(&mut self, frame: &AnnotatedFrame, counts: &CountSnapshot, report: &FrameReport);

    /// Called once when the run stops.
    fn finish(&mut self) {}
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullPresenter;

impl Presenter for NullPresenter {
    fn present(&mut self, _: &AnnotatedFrame, _: &CountSnapshot, _: &FrameReport) {}
}

/// Logs a status line every `every` frames.
#[derive(Clone, Debug)]
pub struct LogPresenter {
    every: u64,
}

impl LogPresenter {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
        }
    }
}

impl Presenter for LogPresenter {
    fn present(&mut self, _frame: &AnnotatedFrame, counts: &CountSnapshot, report: &FrameReport) {
        if report.index % self.every != 0 {
            return;
        }
        log::info!(
            "frame {} ({}): {:.1} fps, cpu {}, gpu {}, visible {}",
            report.index,
            if report.inferred { "inferred" } else { "reused" },
            report.rate,
            format_cpu(&report.resources),
            format_gpu(&report.resources),
            counts.total()
        );
    }
}

/// Status line on a terminal progress bar.
pub struct ProgressPresenter {
    bar: ProgressBar,
}

impl ProgressPresenter {
    /// `total` is the expected frame count, when known.
    pub fn new(total: Option<u64>) -> Self {
        let bar = match total {
            Some(total) => {
                let bar = ProgressBar::new(total);
                let style = ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar());
                bar.set_style(style);
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                let style = ProgressStyle::with_template("{spinner} {pos} frames {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner());
                bar.set_style(style);
                bar
            }
        };
        bar.set_draw_target(ProgressDrawTarget::stderr());
        Self { bar }
    }
}

impl Presenter for ProgressPresenter {
    fn present(&mut self, _frame: &AnnotatedFrame, counts: &CountSnapshot, report: &FrameReport) {
        self.bar.set_position(report.index + 1);
        let gpu_flag = if report.resources.gpu_saturated() { "!" } else { "" };
        self.bar.set_message(format!(
            "{:.1} fps | cpu {} | gpu {}{} | visible {}",
            report.rate,
            format_cpu(&report.resources),
            format_gpu(&report.resources),
            gpu_flag,
            counts.total()
        ));
    }

    fn finish(&mut self) {
        self.bar.finish();
    }
}

#[derive(Serialize)]
struct CountLine<'a> {
    frame: u64,
    source_seq: u64,
    rate: f64,
    counts: &'a CountSnapshot,
}

/// Writes one JSON object per inferred frame: index, rate and per-category counts.
pub struct JsonLinesPresenter<W: Write> {
    out: W,
    failed: bool,
}

impl<W: Write> JsonLinesPresenter<W> {
    pub fn new(out: W) -> Self {
        Self { out, failed: false }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: &CountLine<'_>) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.out, line)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> Presenter for JsonLinesPresenter<W> {
    fn present(&mut self, _frame: &AnnotatedFrame, counts: &CountSnapshot, report: &FrameReport) {
        if self.failed || !report.inferred {
            return;
        }
        let line = CountLine {
            frame: report.index,
            source_seq: report.source_seq,
            rate: report.rate,
            counts,
        };
        if let Err(err) = self.write_line(&line) {
            self.failed = true;
            log::warn!("count log disabled after write failure: {:#}", err);
        }
    }

    fn finish(&mut self) {
        if let Err(err) = self.out.flush() {
            log::warn!("count log flush failed: {}", err);
        }
    }
}

/// Fans a frame out to several presenters, in order.
#[derive(Default)]
pub struct PresenterSet {
    presenters: Vec<Box<dyn Presenter>>,
}

impl PresenterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, presenter: Box<dyn Presenter>) {
        self.presenters.push(presenter);
    }

    pub fn len(&self) -> usize {
        self.presenters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presenters.is_empty()
    }
}

impl Presenter for PresenterSet {
    fn present(&mut self, frame: &AnnotatedFrame, counts: &CountSnapshot, report: &FrameReport) {
        for presenter in &mut self.presenters {
            presenter.present(frame, counts, report);
        }
    }

    fn finish(&mut self) {
        for presenter in &mut self.presenters {
            presenter.finish();
        }
    }
}

fn format_cpu(reading: &ResourceReading) -> String {
    match reading.cpu_percent {
        Some(cpu) => format!("{:.0}%", cpu),
        None => "n/a".to_string(),
    }
}

fn format_gpu(reading: &ResourceReading) -> String {
    match reading.gpu {
        Some(gpu) => match gpu.mem_used_mb {
            Some(mem) => format!("{:.0}% {}MB", gpu.utilization_percent, mem),
            None => format!("{:.0}%", gpu.utilization_percent),
        },
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::Categories;
    use crate::frame::Frame;
    use crate::resources::GpuReading;

    fn report(index: u64, inferred: bool) -> FrameReport {
        FrameReport {
            index,
            source_seq: index,
            inferred,
            rate: 12.5,
            resources: ResourceReading::default(),
            frames_written: index + 1,
            persisting: true,
        }
    }

    #[test]
    fn json_lines_only_records_inferred_frames() {
        let cats = Categories::new(["car", "bus"]).unwrap();
        let counts = CountSnapshot::zeroed(&cats);
        let frame = AnnotatedFrame::passthrough(Frame::filled(0, 2, 2, [0, 0, 0]).unwrap());
        let mut presenter = JsonLinesPresenter::new(Vec::new());
        presenter.present(&frame, &counts, &report(0, true));
        presenter.present(&frame, &counts, &report(1, false));
        presenter.present(&frame, &counts, &report(2, true));
        let text = String::from_utf8(presenter.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            r#"{"frame":0,"source_seq":0,"rate":12.5,"counts":{"car":0,"bus":0}}"#
        );
    }

    #[test]
    fn missing_sensors_render_as_unavailable() {
        let reading = ResourceReading::default();
        assert_eq!(format_cpu(&reading), "n/a");
        assert_eq!(format_gpu(&reading), "n/a");
        let busy = ResourceReading {
            cpu_percent: Some(41.4),
            gpu: Some(GpuReading {
                utilization_percent: 85.0,
                mem_used_mb: Some(512),
            }),
        };
        assert_eq!(format_cpu(&busy), "41%");
        assert_eq!(format_gpu(&busy), "85% 512MB");
    }

    #[test]
    fn presenter_set_forwards_to_all() {
        let mut set = PresenterSet::new();
        set.push(Box::new(NullPresenter));
        set.push(Box::new(LogPresenter::new(10)));
        assert_eq!(set.len(), 2);
        let cats = Categories::default();
        let frame = AnnotatedFrame::passthrough(Frame::filled(0, 2, 2, [0, 0, 0]).unwrap());
        set.present(&frame, &CountSnapshot::zeroed(&cats), &report(0, true));
        set.finish();
    }
}
