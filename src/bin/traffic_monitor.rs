//! traffic_monitor - count vehicles in stored video with frame-skipping detection
//!
//! Loads configuration (file, environment, then flags), assembles the pipeline
//! and drives it on the main thread. Ctrl-C requests a clean stop; a reporter
//! thread logs the published snapshot at a fixed interval.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, IsTerminal};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use traffic_monitor::config::{MonitorConfig, OutputTarget};
use traffic_monitor::present::{JsonLinesPresenter, PresenterSet};
use traffic_monitor::sink::OutputFormat;
use traffic_monitor::ui::{Ui, UiMode};
use traffic_monitor::{
    BackendRegistry, DetectorBackend, FileConfig, FileSource, Pipeline, ResourceMonitor,
    SnapshotBoard, StopReason, StubBackend,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "TRAFFIC_MONITOR_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Input video file or `stub://` clip.
    #[arg(long, value_name = "PATH")]
    input: Option<String>,
    /// Annotated output file.
    #[arg(long, value_name = "PATH", conflicts_with = "no_output")]
    output: Option<PathBuf>,
    /// Output container (raw or mp4).
    #[arg(long, value_name = "FORMAT")]
    format: Option<OutputFormat>,
    /// Run without writing an output stream.
    #[arg(long)]
    no_output: bool,
    /// Frames skipped between inferences.
    #[arg(long)]
    skip_interval: Option<u32>,
    /// Detector backend name.
    #[arg(long)]
    detector: Option<String>,
    /// Model file for backends that load one.
    #[arg(long, value_name = "PATH")]
    model: Option<PathBuf>,
    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,
    /// JSON-lines file receiving per-category counts of inferred frames.
    #[arg(long, value_name = "PATH")]
    counts_log: Option<PathBuf>,
    /// Print registered detector backends and exit.
    #[arg(long)]
    list_detectors: bool,
    /// Disable CPU/GPU sampling.
    #[arg(long)]
    no_sensors: bool,
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::new(UiMode::parse(Some(&args.ui)), std::io::stderr().is_terminal());

    let cfg = {
        let _stage = ui.stage("Load configuration");
        let mut cfg = MonitorConfig::load_from(args.config.as_deref())?;
        apply_args(&mut cfg, &args);
        cfg.validate()?;
        cfg
    };

    let mut registry = build_registry(&cfg)?;
    if args.list_detectors {
        for name in registry.list() {
            println!("{name}");
        }
        return Ok(());
    }
    let detector = registry.take(&cfg.detector.backend)?;

    let source = {
        let _stage = ui.stage("Open input");
        FileSource::new(FileConfig {
            path: cfg.input.clone(),
            max_frames: None,
        })?
    };

    let mut presenters = PresenterSet::new();
    presenters.push(ui.frame_presenter(cfg.pipeline.max_frames, 100));
    if let Some(path) = &cfg.report.counts_log {
        let file = File::create(path)
            .with_context(|| format!("create counts log {}", path.display()))?;
        presenters.push(Box::new(JsonLinesPresenter::new(BufWriter::new(file))));
    }
    let resources = if args.no_sensors {
        ResourceMonitor::disabled()
    } else {
        ResourceMonitor::system()
    };

    let mut pipeline = Pipeline::new(cfg.pipeline.clone(), Box::new(source), detector)?
        .with_presenter(Box::new(presenters))
        .with_resource_monitor(resources);

    let stop = pipeline.stop_handle();
    ctrlc::set_handler(move || {
        log::info!("stop requested, finishing current frame...");
        stop.request_stop();
    })
    .context("install Ctrl-C handler")?;

    let reporter_done = Arc::new(AtomicBool::new(false));
    let reporter = spawn_reporter(
        pipeline.snapshot_board(),
        cfg.report.interval,
        reporter_done.clone(),
    );

    let result = pipeline.run();
    reporter_done.store(true, Ordering::SeqCst);
    if reporter.join().is_err() {
        log::warn!("reporter thread panicked");
    }

    let summary = result?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    match summary.reason {
        StopReason::ModelFailure | StopReason::SourceFailure => {
            Err(anyhow!("run ended early: {}", summary.reason))
        }
        StopReason::SourceExhausted | StopReason::StopRequested => Ok(()),
    }
}

fn apply_args(cfg: &mut MonitorConfig, args: &Args) {
    if let Some(input) = &args.input {
        cfg.input = input.clone();
    }
    if args.no_output {
        cfg.pipeline.output = None;
    } else if args.output.is_some() || args.format.is_some() {
        let target = cfg
            .pipeline
            .output
            .get_or_insert_with(|| OutputTarget::new(args.format.unwrap_or_default()));
        if let Some(format) = args.format {
            if args.output.is_none() && target.path == OutputTarget::default_path(target.format) {
                target.path = OutputTarget::default_path(format);
            }
            target.format = format;
        }
        if let Some(path) = &args.output {
            target.path = path.clone();
        }
    }
    if let Some(skip) = args.skip_interval {
        cfg.pipeline.skip_interval = skip;
    }
    if let Some(detector) = &args.detector {
        cfg.detector.backend = detector.clone();
    }
    if let Some(model) = &args.model {
        cfg.detector.model_path = Some(model.clone());
    }
    if let Some(max) = args.max_frames {
        cfg.pipeline.max_frames = Some(max);
    }
    if let Some(path) = &args.counts_log {
        cfg.report.counts_log = Some(path.clone());
    }
}

fn build_registry(cfg: &MonitorConfig) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();
    let stub = StubBackend::with_classes(cfg.pipeline.categories.len().min(u8::MAX as usize) as u8);
    log::debug!("registering detector backend {}", stub.name());
    registry.register(stub);

    register_model_backend(&mut registry, cfg)?;
    Ok(registry)
}

#[cfg(feature = "backend-tract")]
fn register_model_backend(registry: &mut BackendRegistry, cfg: &MonitorConfig) -> Result<()> {
    if let Some(model) = &cfg.detector.model_path {
        let backend =
            traffic_monitor::detect::TractBackend::new(model, cfg.pipeline.inference.resolution)?;
        registry.register(backend);
    }
    Ok(())
}

#[cfg(not(feature = "backend-tract"))]
fn register_model_backend(_registry: &mut BackendRegistry, cfg: &MonitorConfig) -> Result<()> {
    if cfg.detector.model_path.is_some() {
        log::warn!("model path ignored: built without the backend-tract feature");
    }
    Ok(())
}

fn spawn_reporter(
    board: SnapshotBoard,
    interval: Duration,
    done: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let tick = Duration::from_millis(100).min(interval);
        let mut waited = Duration::ZERO;
        while !done.load(Ordering::SeqCst) {
            thread::sleep(tick);
            waited += tick;
            if waited < interval {
                continue;
            }
            waited = Duration::ZERO;
            let Some(snap) = board.latest() else {
                continue;
            };
            let counts: Vec<String> = snap
                .counts
                .iter()
                .filter(|(_, n)| *n > 0)
                .map(|(name, n)| format!("{name}={n}"))
                .collect();
            log::info!(
                "[report] frames={} inferences={} written={} rate={:.1}fps persisting={} counts: {}",
                snap.frames_processed,
                snap.inferences,
                snap.frames_written,
                snap.rate,
                snap.persisting,
                if counts.is_empty() {
                    "none".to_string()
                } else {
                    counts.join(", ")
                }
            );
        }
    })
}
