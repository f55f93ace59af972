//! Terminal output for the CLI host.
//!
//! Pretty mode uses `indicatif` spinners and a per-frame progress line; plain
//! mode writes stage markers to stderr and logs a status line periodically.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::present::{LogPresenter, Presenter, ProgressPresenter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    pub fn parse(flag: Option<&str>) -> Self {
        match flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    pub fn is_pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    /// Spinner (pretty) or `==>` marker (plain) until the guard drops.
    pub fn stage(&self, name: &str) -> StageGuard {
        if self.is_pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Per-frame presenter for the run: a progress line when pretty, otherwise a
    /// log line every `log_every` frames.
    pub fn frame_presenter(&self, total_frames: Option<u64>, log_every: u64) -> Box<dyn Presenter> {
        if self.is_pretty() {
            Box::new(ProgressPresenter::new(total_frames))
        } else {
            Box::new(LogPresenter::new(log_every))
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.name, format_duration(self.start.elapsed()));
        match &self.spinner {
            Some(spinner) => spinner.finish_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

pub fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_flag_or_no_tty_disables_pretty_output() {
        assert!(!Ui::new(UiMode::parse(Some("plain")), true).is_pretty());
        assert!(!Ui::new(UiMode::Pretty, false).is_pretty());
        assert!(Ui::new(UiMode::parse(None), true).is_pretty());
    }

    #[test]
    fn durations_switch_units_at_one_second() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
