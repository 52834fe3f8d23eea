//! stereo_rtd - stereo capture and detection daemon
//!
//! This daemon:
//! 1. Loads the rig configuration (file, then environment overrides)
//! 2. Opens the left and right cameras and the detector backend
//! 3. Runs the five-stage pipeline until Ctrl-C/SIGTERM or `--duration-secs`
//! 4. Logs per-stage statistics on shutdown, optionally exporting them as JSON

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use stereo_rt::{
    config::DaemonConfig,
    detect::build_engine,
    ingest::open_stereo_pair,
    pipeline::{CycleReport, PipelineParts, StereoPipeline},
    sink::{ConsoleSink, LogSink, ResultSink},
    RealtimePolicy, TaskStats,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SinkKind {
    /// Redraw a detection table on stdout.
    Console,
    /// One log line per result set.
    Log,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run the periodic stereo capture and detection pipeline"
)]
struct Args {
    /// Config file (JSON, or TOML by extension). Overrides STEREO_RT_CONFIG.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "SECS")]
    duration_secs: Option<u64>,

    /// Where detection results go.
    #[arg(long, value_enum, default_value_t = SinkKind::Console)]
    sink: SinkKind,

    /// Write final task and cycle statistics to this file.
    #[arg(long, value_name = "PATH")]
    stats_json: Option<PathBuf>,

    /// Fail startup if core pinning or realtime priority cannot be applied.
    #[arg(long)]
    strict_realtime: bool,

    /// Startup output style.
    #[arg(long, value_enum, default_value_t = ui::UiMode::Auto, value_name = "MODE")]
    ui: ui::UiMode,
}

#[derive(Serialize)]
struct RunReport<'a> {
    tasks: &'a [TaskStats],
    cycles: CycleReport,
    deadline_misses_reported: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let console_owned = args.sink == SinkKind::Console && std::io::stdout().is_terminal();
    let ui = ui::StartupUi::new(args.ui, std::io::stderr().is_terminal(), console_owned);
    log::debug!("startup ui: pretty={}", ui.is_pretty());

    let phase = ui.phase("Load configuration");
    let mut cfg = match &args.config {
        Some(path) => DaemonConfig::load_from(Some(path.as_path()))?,
        None => DaemonConfig::load()?,
    };
    if args.strict_realtime {
        cfg.policy = RealtimePolicy::Strict;
    }
    phase.done();
    log::info!(
        "camera={:?} left={} right={} policy={:?}",
        cfg.camera_kind,
        cfg.left_device,
        cfg.right_device,
        cfg.policy
    );

    let phase = ui.phase("Open cameras");
    let (left, right) = open_stereo_pair(
        cfg.camera_kind,
        &cfg.left_device,
        &cfg.right_device,
        &cfg.pipeline.camera,
        cfg.synthetic_disparity_px,
    )?;
    phase.done();

    let phase = ui.phase("Load detector");
    let engine = build_engine(&cfg.detector)?;
    phase.done();
    log::info!("detector backend: {}", engine.name());

    let sink: Box<dyn ResultSink> = match args.sink {
        SinkKind::Console => Box::new(ConsoleSink::stdout()),
        SinkKind::Log => Box::new(LogSink),
    };

    let phase = ui.phase("Warm up and build pipeline");
    let mut pipeline = StereoPipeline::new(
        cfg.pipeline.clone(),
        PipelineParts {
            left,
            right,
            engine,
            sink,
        },
        cfg.policy,
    )?;
    phase.done();

    let misses = Arc::new(AtomicU64::new(0));
    {
        let misses = misses.clone();
        pipeline.set_deadline_callback(move |task| {
            let total = misses.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!("{} missed its deadline ({} total)", task, total);
        });
    }

    let phase = ui.phase("Start scheduler");
    pipeline.start()?;
    phase.done();

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    match args.duration_secs {
        Some(secs) => {
            log::info!("stereo_rtd running for {}s (Ctrl-C stops early)", secs);
            let _ = rx.recv_timeout(Duration::from_secs(secs));
        }
        None => {
            log::info!("stereo_rtd waiting for shutdown signal (Ctrl-C)...");
            let _ = rx.recv();
        }
    }
    log::info!("shutdown requested, stopping pipeline...");
    pipeline.stop();

    let tasks = pipeline.task_stats();
    let cycles = pipeline.cycle_report();
    log_summary(&tasks, &cycles);

    if let Some(path) = &args.stats_json {
        let report = RunReport {
            tasks: &tasks,
            cycles,
            deadline_misses_reported: misses.load(Ordering::Relaxed),
        };
        write_report(path, &report)?;
        log::info!("statistics written to {}", path.display());
    }
    Ok(())
}

fn log_summary(tasks: &[TaskStats], cycles: &CycleReport) {
    for stats in tasks {
        log::info!(
            "{:<14} runs={} missed={} failed={} overruns={} avg={:.0}us max={:.0}us jitter={:.0}us wake={:.0}us meet={:.1}%",
            stats.name,
            stats.total_executions,
            stats.missed_deadlines,
            stats.failed_executions,
            stats.overruns,
            stats.average_execution_time_us,
            stats.max_execution_time_us,
            stats.jitter_us,
            stats.average_wakeup_latency_us,
            stats.deadline_meet_rate * 100.0
        );
    }
    log::info!(
        "cycles={} results={} over budget={} ({:.1}%) max latency={}us",
        cycles.cycles,
        cycles.results,
        cycles.missed,
        cycles.miss_rate() * 100.0,
        cycles.max_latency_us
    );
}

fn write_report(path: &Path, report: &RunReport<'_>) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), report)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
