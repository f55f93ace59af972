//! Run configuration.
//!
//! `MonitorConfig::load` reads an optional TOML file named by
//! `TRAFFIC_MONITOR_CONFIG`, fills in defaults, applies environment overrides and
//! validates the result. Every failure is a `CONFIG_ERROR` and happens before any
//! source, detector or sink is touched.

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::counts::{Categories, CountPolicy};
use crate::detect::InferenceParams;
use crate::sink::OutputFormat;
use crate::PipelineError;

const DEFAULT_INPUT: &str = "stub://traffic";
/// Output file name, without extension, used when no path is configured.
pub const DEFAULT_OUTPUT_STEM: &str = "traffic_output";
const DEFAULT_SKIP_INTERVAL: i64 = 2;
const DEFAULT_DETECTOR: &str = "stub";
const DEFAULT_REPORT_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MonitorConfigFile {
    pipeline: Option<PipelineConfigFile>,
    input: Option<InputConfigFile>,
    output: Option<OutputConfigFile>,
    detector: Option<DetectorConfigFile>,
    report: Option<ReportConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    skip_interval: Option<i64>,
    categories: Option<Vec<String>>,
    confidence_threshold: Option<f32>,
    inference_resolution: Option<u32>,
    persist_tracking: Option<bool>,
    count_policy: Option<CountPolicy>,
    max_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct InputConfigFile {
    path: Option<String>,
    target_fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct OutputConfigFile {
    enabled: Option<bool>,
    path: Option<PathBuf>,
    format: Option<OutputFormat>,
    frame_rate: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ReportConfigFile {
    interval_secs: Option<u64>,
    counts_log: Option<PathBuf>,
}

/// Where the annotated stream goes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTarget {
    pub path: PathBuf,
    pub format: OutputFormat,
    /// Overrides the source frame rate.
    pub frame_rate: Option<f64>,
}

impl OutputTarget {
    /// Default target for `format`: `traffic_output.<ext>`, source frame rate.
    pub fn new(format: OutputFormat) -> Self {
        Self {
            path: Self::default_path(format),
            format,
            frame_rate: None,
        }
    }

    pub fn default_path(format: OutputFormat) -> PathBuf {
        PathBuf::from(DEFAULT_OUTPUT_STEM).with_extension(format.extension())
    }
}

/// Settings the pipeline driver needs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub skip_interval: u32,
    pub categories: Categories,
    pub inference: InferenceParams,
    pub count_policy: CountPolicy,
    /// Stop after this many frames.
    pub max_frames: Option<u64>,
    /// `None` runs without persistence.
    pub output: Option<OutputTarget>,
    /// Frame rate assumed when the source does not declare one.
    pub fallback_frame_rate: Option<f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            skip_interval: DEFAULT_SKIP_INTERVAL as u32,
            categories: Categories::default(),
            inference: InferenceParams::default(),
            count_policy: CountPolicy::default(),
            max_frames: None,
            output: None,
            fallback_frame_rate: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        let threshold = self.inference.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::config(format!(
                "confidence_threshold must be within [0, 1], got {}",
                threshold
            ))
            .into());
        }
        if self.inference.resolution == 0 {
            return Err(PipelineError::config("inference_resolution must be > 0").into());
        }
        if self.categories.is_empty() {
            return Err(PipelineError::config("categories must not be empty").into());
        }
        if self.max_frames == Some(0) {
            return Err(PipelineError::config("max_frames must be > 0 when set").into());
        }
        let rates = [
            ("output.frame_rate", self.output.as_ref().and_then(|o| o.frame_rate)),
            ("input.target_fps", self.fallback_frame_rate),
        ];
        for (name, rate) in rates {
            if let Some(rate) = rate {
                if !rate.is_finite() || rate <= 0.0 {
                    return Err(
                        PipelineError::config(format!("{} must be > 0, got {}", name, rate)).into(),
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportSettings {
    pub interval: Duration,
    /// JSON-lines file receiving the counts of every inferred frame.
    pub counts_log: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub input: String,
    pub pipeline: PipelineConfig,
    pub detector: DetectorSettings,
    pub report: ReportSettings,
}

impl MonitorConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TRAFFIC_MONITOR_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with the file path given explicitly.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: MonitorConfigFile = toml::from_str(raw)
            .map_err(|e| PipelineError::config(format!("invalid config: {}", e)))?;
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Result<Self> {
        let pipeline_file = file.pipeline.unwrap_or_default();
        let skip_interval =
            checked_skip_interval(pipeline_file.skip_interval.unwrap_or(DEFAULT_SKIP_INTERVAL))?;
        let categories = match pipeline_file.categories {
            Some(names) => Categories::new(names)
                .map_err(|e| PipelineError::config(format!("categories: {}", e)))?,
            None => Categories::default(),
        };
        let defaults = InferenceParams::default();
        let inference = InferenceParams {
            persist_tracking: pipeline_file
                .persist_tracking
                .unwrap_or(defaults.persist_tracking),
            confidence_threshold: pipeline_file
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            resolution: pipeline_file
                .inference_resolution
                .unwrap_or(defaults.resolution),
        };

        let output_file = file.output.unwrap_or_default();
        let output = output_file.enabled.unwrap_or(true).then(|| {
            let format = output_file.format.unwrap_or_default();
            OutputTarget {
                path: output_file
                    .path
                    .unwrap_or_else(|| OutputTarget::default_path(format)),
                format,
                frame_rate: output_file.frame_rate,
            }
        });

        let input_file = file.input.unwrap_or_default();
        let pipeline = PipelineConfig {
            skip_interval,
            categories,
            inference,
            count_policy: pipeline_file.count_policy.unwrap_or_default(),
            max_frames: pipeline_file.max_frames,
            output,
            fallback_frame_rate: input_file.target_fps,
        };

        let detector_file = file.detector.unwrap_or_default();
        let report_file = file.report.unwrap_or_default();
        Ok(Self {
            input: input_file
                .path
                .unwrap_or_else(|| DEFAULT_INPUT.to_string()),
            pipeline,
            detector: DetectorSettings {
                backend: detector_file
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
                model_path: detector_file.model_path,
            },
            report: ReportSettings {
                interval: Duration::from_secs(
                    report_file
                        .interval_secs
                        .unwrap_or(DEFAULT_REPORT_INTERVAL_SECS),
                ),
                counts_log: report_file.counts_log,
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(input) = std::env::var("TRAFFIC_INPUT") {
            if !input.trim().is_empty() {
                self.input = input;
            }
        }
        if let Ok(output) = std::env::var("TRAFFIC_OUTPUT") {
            if !output.trim().is_empty() {
                let target = self
                    .pipeline
                    .output
                    .get_or_insert_with(|| OutputTarget::new(OutputFormat::default()));
                target.path = PathBuf::from(output);
            }
        }
        if let Ok(skip) = std::env::var("TRAFFIC_SKIP_INTERVAL") {
            let value: i64 = skip.trim().parse().map_err(|_| {
                PipelineError::config("TRAFFIC_SKIP_INTERVAL must be an integer")
            })?;
            self.pipeline.skip_interval = checked_skip_interval(value)?;
        }
        if let Ok(categories) = std::env::var("TRAFFIC_CATEGORIES") {
            let parsed = split_csv(&categories);
            if !parsed.is_empty() {
                self.pipeline.categories = Categories::new(parsed)
                    .map_err(|e| PipelineError::config(format!("TRAFFIC_CATEGORIES: {}", e)))?;
            }
        }
        if let Ok(backend) = std::env::var("TRAFFIC_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("TRAFFIC_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.input.trim().is_empty() {
            return Err(PipelineError::config("input path must not be empty").into());
        }
        if self.detector.backend.trim().is_empty() {
            return Err(PipelineError::config("detector backend must not be empty").into());
        }
        if self.report.interval.is_zero() {
            return Err(PipelineError::config("report interval must be greater than zero").into());
        }
        self.pipeline.validate()
    }
}

fn checked_skip_interval(value: i64) -> Result<u32> {
    if value < 0 {
        let message = format!("skip_interval must be >= 0, got {}", value);
        return Err(PipelineError::config(message).into());
    }
    u32::try_from(value).map_err(|_| {
        PipelineError::config(format!("skip_interval {} is too large", value)).into()
    })
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::config(format!("failed to read config file {}: {}", path.display(), e))
    })?;
    let cfg = toml::from_str(&raw).map_err(|e| {
        PipelineError::config(format!("invalid config file {}: {}", path.display(), e))
    })?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
