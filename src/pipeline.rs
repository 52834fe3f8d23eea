//! Stereo detection pipeline.
//!
//! Five independently periodic stages share one `PipelineCoordinator`:
//!
//! ```text
//! left_capture  ─┐
//!                ├─ merged ─> preprocess ─ preprocessed ─> detect ─ detections ─> monitor
//! right_capture ─┘
//! ```
//!
//! Capture stages write their half of the merged view and signal once both
//! halves are fresh. Preprocess and detect wait (bounded by half their
//! deadline) for the upstream signal and skip the iteration when nothing new
//! arrived. The monitor polls the latest detections, checks their end-to-end
//! latency against the cycle budget and hands new results to the sink. It
//! also logs when a camera's health verdict changes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde::Serialize;

use crate::context::RealtimePolicy;
use crate::coordinator::{PipelineCoordinator, ReadCursor};
use crate::detect::{DetectionSnapshot, InferenceEngine};
use crate::error::{config_err, resource_err, RtResult};
use crate::frame::{Side, StereoFrame, TensorFrame, DETECTOR_INPUT_SIZE};
use crate::ingest::{CameraSettings, FrameSource};
use crate::perf::TaskStats;
use crate::scheduler::Scheduler;
use crate::sink::ResultSink;
use crate::task::{CpuCore, TaskConfig, TaskSpec};

pub const LEFT_CAPTURE: &str = "left_capture";
pub const RIGHT_CAPTURE: &str = "right_capture";
pub const PREPROCESS: &str = "preprocess";
pub const DETECT: &str = "detect";
pub const MONITOR: &str = "monitor";

pub const DEFAULT_CYCLE_BUDGET: Duration = Duration::from_millis(660);
pub const DEFAULT_SUMMARY_EVERY_CYCLES: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageTiming {
    pub period: Duration,
    pub deadline: Duration,
    pub priority: u8,
    pub core: CpuCore,
}

impl StageTiming {
    /// Deadline equal to the period.
    pub fn new(period: Duration, priority: u8, core: CpuCore) -> Self {
        Self {
            period,
            deadline: period,
            priority,
            core,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Longest a stage waits for its upstream signal inside one iteration.
    fn signal_wait(&self) -> Duration {
        self.deadline / 2
    }

    fn spec(&self, name: &str) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            period: self.period,
            deadline: self.deadline,
            priority: self.priority,
            core: self.core,
        }
    }

    fn task<F>(&self, name: &str, work: F) -> TaskConfig
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        TaskConfig::new(name, self.period, work)
            .with_deadline(self.deadline)
            .with_priority(self.priority)
            .on_core(self.core)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub cycle_budget: Duration,
    pub left_capture: StageTiming,
    pub right_capture: StageTiming,
    pub preprocess: StageTiming,
    pub detect: StageTiming,
    pub monitor: StageTiming,
    pub camera: CameraSettings,
    pub tensor_width: u32,
    pub tensor_height: u32,
    pub summary_every_cycles: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let ms = Duration::from_millis;
        Self {
            cycle_budget: DEFAULT_CYCLE_BUDGET,
            left_capture: StageTiming::new(ms(110), 99, CpuCore::Pinned(2)),
            right_capture: StageTiming::new(ms(110), 99, CpuCore::Pinned(3)),
            preprocess: StageTiming::new(ms(110), 98, CpuCore::Pinned(1)),
            detect: StageTiming::new(ms(220), 97, CpuCore::Pinned(3)),
            monitor: StageTiming::new(ms(110), 96, CpuCore::Any),
            camera: CameraSettings::default(),
            tensor_width: DETECTOR_INPUT_SIZE,
            tensor_height: DETECTOR_INPUT_SIZE,
            summary_every_cycles: DEFAULT_SUMMARY_EVERY_CYCLES,
        }
    }
}

impl PipelineConfig {
    pub fn stages(&self) -> [(&'static str, StageTiming); 5] {
        [
            (LEFT_CAPTURE, self.left_capture),
            (RIGHT_CAPTURE, self.right_capture),
            (PREPROCESS, self.preprocess),
            (DETECT, self.detect),
            (MONITOR, self.monitor),
        ]
    }

    /// Leave every stage on a free core with normal scheduling.
    pub fn unpinned(mut self) -> Self {
        for stage in [
            &mut self.left_capture,
            &mut self.right_capture,
            &mut self.preprocess,
            &mut self.detect,
            &mut self.monitor,
        ] {
            stage.core = CpuCore::Any;
            stage.priority = 0;
        }
        self
    }

    /// Worst-case capture-to-display latency implied by the stage deadlines.
    pub fn deadline_chain(&self) -> Duration {
        self.left_capture.deadline.max(self.right_capture.deadline)
            + self.preprocess.deadline
            + self.detect.deadline
            + self.monitor.deadline
    }

    pub fn validate(&self) -> RtResult<()> {
        if self.cycle_budget.is_zero() {
            return Err(config_err("cycle budget must be greater than zero"));
        }
        for (name, timing) in self.stages() {
            timing.spec(name).validate()?;
        }
        if self.camera.width == 0 || self.camera.height == 0 || self.camera.fps == 0 {
            return Err(config_err(format!(
                "camera settings {}x{} @{}fps are not valid",
                self.camera.width, self.camera.height, self.camera.fps
            )));
        }
        if self.tensor_width == 0 || self.tensor_height == 0 {
            return Err(config_err(format!(
                "detector input {}x{} is not valid",
                self.tensor_width, self.tensor_height
            )));
        }
        if self.summary_every_cycles == 0 {
            return Err(config_err("summary interval must be at least one cycle"));
        }
        let chain = self.deadline_chain();
        if chain > self.cycle_budget {
            return Err(config_err(format!(
                "stage deadlines add up to {:?}, above the {:?} cycle budget",
                chain, self.cycle_budget
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Monitor iterations.
    pub cycles: u64,
    /// Distinct detection results observed.
    pub results: u64,
    /// Results whose capture-to-monitor latency exceeded the budget.
    pub missed: u64,
    pub last_latency_us: Option<u64>,
    pub max_latency_us: u64,
}

impl CycleReport {
    pub fn miss_rate(&self) -> f64 {
        if self.results == 0 {
            0.0
        } else {
            self.missed as f64 / self.results as f64
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    NoNewResult,
    WithinBudget(Duration),
    Missed(Duration),
    /// New result without a capture instant.
    Unmeasured,
}

/// End-to-end latency check run once per monitor iteration.
pub struct CycleMonitor {
    budget: Duration,
    summary_every: u64,
    state: Mutex<CycleState>,
}

#[derive(Default)]
struct CycleState {
    report: CycleReport,
    last_sequence: u64,
}

impl CycleMonitor {
    pub fn new(budget: Duration, summary_every: u64) -> Self {
        Self {
            budget,
            summary_every: summary_every.max(1),
            state: Mutex::new(CycleState::default()),
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn observe(&self, latest: Option<&DetectionSnapshot>, now: Instant) -> CycleOutcome {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.report.cycles += 1;

        let outcome = match latest {
            Some(snapshot) if snapshot.sequence != state.last_sequence => {
                state.last_sequence = snapshot.sequence;
                state.report.results += 1;
                match snapshot.latency_at(now) {
                    Some(latency) => {
                        let us = latency.as_micros() as u64;
                        state.report.last_latency_us = Some(us);
                        state.report.max_latency_us = state.report.max_latency_us.max(us);
                        if latency > self.budget {
                            state.report.missed += 1;
                            log::warn!(
                                "system cycle missed budget: latency {:.2}ms > {:.2}ms",
                                latency.as_secs_f64() * 1e3,
                                self.budget.as_secs_f64() * 1e3
                            );
                            CycleOutcome::Missed(latency)
                        } else {
                            CycleOutcome::WithinBudget(latency)
                        }
                    }
                    None => CycleOutcome::Unmeasured,
                }
            }
            _ => CycleOutcome::NoNewResult,
        };

        if state.report.cycles.is_multiple_of(self.summary_every) {
            let report = state.report;
            log::info!(
                "Performance: cycles={}, results={}, missed={}, rate={:.2}%, last latency={}",
                report.cycles,
                report.results,
                report.missed,
                report.miss_rate() * 100.0,
                report
                    .last_latency_us
                    .map(|us| format!("{:.2}ms", us as f64 / 1e3))
                    .unwrap_or_else(|| "n/a".to_string())
            );
        }
        outcome
    }

    pub fn report(&self) -> CycleReport {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).report
    }
}

/// Latest `FrameSource::is_healthy` verdict per camera, written by the
/// capture stages after every read.
#[derive(Debug)]
pub struct CameraHealth {
    left: AtomicBool,
    right: AtomicBool,
}

impl Default for CameraHealth {
    fn default() -> Self {
        Self {
            left: AtomicBool::new(true),
            right: AtomicBool::new(true),
        }
    }
}

impl CameraHealth {
    fn flag(&self, side: Side) -> &AtomicBool {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn is_healthy(&self, side: Side) -> bool {
        self.flag(side).load(Ordering::Relaxed)
    }

    fn set(&self, side: Side, healthy: bool) {
        self.flag(side).store(healthy, Ordering::Relaxed);
    }
}

/// External collaborators the pipeline drives.
pub struct PipelineParts {
    pub left: Box<dyn FrameSource>,
    pub right: Box<dyn FrameSource>,
    pub engine: Box<dyn InferenceEngine>,
    pub sink: Box<dyn ResultSink>,
}

pub struct StereoPipeline {
    config: PipelineConfig,
    scheduler: Scheduler,
    coordinator: Arc<PipelineCoordinator>,
    cycles: Arc<CycleMonitor>,
    health: Arc<CameraHealth>,
}

impl StereoPipeline {
    /// Validate the configuration, warm the engine up and build the five stages.
    pub fn new(
        config: PipelineConfig,
        parts: PipelineParts,
        policy: RealtimePolicy,
    ) -> RtResult<Self> {
        config.validate()?;
        let PipelineParts {
            left,
            right,
            mut engine,
            sink,
        } = parts;
        engine
            .warm_up()
            .map_err(|err| resource_err(format!("detector warm-up failed: {:#}", err)))?;

        let coordinator = Arc::new(PipelineCoordinator::new());
        coordinator
            .merged
            .mailbox()
            .write(StereoFrame::new(config.camera.width, config.camera.height)?);
        let cycles = Arc::new(CycleMonitor::new(
            config.cycle_budget,
            config.summary_every_cycles,
        ));
        let health = Arc::new(CameraHealth::default());

        let tasks = vec![
            capture_stage(LEFT_CAPTURE, &config.left_capture, Side::Left, left, &coordinator, &health),
            capture_stage(RIGHT_CAPTURE, &config.right_capture, Side::Right, right, &coordinator, &health),
            preprocess_stage(&config, &coordinator),
            detect_stage(&config.detect, engine, &coordinator),
            monitor_stage(&config.monitor, sink, &coordinator, &cycles, &health),
        ];
        let scheduler = Scheduler::with_policy(tasks, policy)?;
        log::info!(
            "pipeline ready: budget {:?}, deadline chain {:?}, camera {}x{}, detector input {}x{}",
            config.cycle_budget,
            config.deadline_chain(),
            config.camera.width,
            config.camera.height,
            config.tensor_width,
            config.tensor_height
        );

        Ok(Self {
            config,
            scheduler,
            coordinator,
            cycles,
            health,
        })
    }

    pub fn start(&mut self) -> RtResult<()> {
        self.scheduler.start()
    }

    pub fn stop(&mut self) {
        self.scheduler.stop();
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn task_stats(&self) -> Vec<TaskStats> {
        self.scheduler.task_stats()
    }

    pub fn cycle_report(&self) -> CycleReport {
        self.cycles.report()
    }

    pub fn camera_health(&self) -> &CameraHealth {
        &self.health
    }

    pub fn coordinator(&self) -> &Arc<PipelineCoordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn set_deadline_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.scheduler.set_deadline_callback(callback);
    }
}

fn capture_stage(
    name: &str,
    timing: &StageTiming,
    side: Side,
    mut source: Box<dyn FrameSource>,
    coordinator: &Arc<PipelineCoordinator>,
    health: &Arc<CameraHealth>,
) -> TaskConfig {
    let coordinator = coordinator.clone();
    let health = health.clone();
    timing.task(name, move || {
        let frame = source.read();
        health.set(side, source.is_healthy());
        let frame = frame?;
        let updated = coordinator.merged.mailbox().update(|stereo| {
            stereo
                .update_half(side, &frame)
                .map(|()| stereo.take_fresh_pair())
        });
        match updated {
            Some((_, Ok(true))) => {
                coordinator.merged.signal();
                Ok(())
            }
            Some((_, Ok(false))) => Ok(()),
            Some((_, Err(err))) => Err(err.into()),
            None => Err(anyhow!("merged view was never initialised")),
        }
    })
}

fn preprocess_stage(config: &PipelineConfig, coordinator: &Arc<PipelineCoordinator>) -> TaskConfig {
    let coordinator = coordinator.clone();
    let wait = config.preprocess.signal_wait();
    let (width, height) = (config.tensor_width, config.tensor_height);
    let mut cursor = ReadCursor::default();
    config.preprocess.task(PREPROCESS, move || {
        let Some(stereo) = coordinator.merged.wait_ready(&mut cursor, wait) else {
            return Ok(());
        };
        let tensor = TensorFrame::from_stereo(&stereo, width, height)?;
        drop(stereo);
        coordinator.preprocessed.publish(tensor);
        Ok(())
    })
}

fn detect_stage(
    timing: &StageTiming,
    mut engine: Box<dyn InferenceEngine>,
    coordinator: &Arc<PipelineCoordinator>,
) -> TaskConfig {
    let coordinator = coordinator.clone();
    let wait = timing.signal_wait();
    let mut cursor = ReadCursor::default();
    let mut sequence = 0u64;
    timing.task(DETECT, move || {
        let Some(tensor) = coordinator.preprocessed.wait_ready(&mut cursor, wait) else {
            return Ok(());
        };
        let started = Instant::now();
        let detections = engine.detect(&tensor)?;
        let inference_time = engine
            .last_inference_time()
            .unwrap_or_else(|| started.elapsed());
        sequence += 1;
        coordinator.detections.publish(DetectionSnapshot {
            sequence,
            detections,
            captured_at: tensor.captured_at(),
            completed_at: Instant::now(),
            inference_time,
        });
        Ok(())
    })
}

fn monitor_stage(
    timing: &StageTiming,
    mut sink: Box<dyn ResultSink>,
    coordinator: &Arc<PipelineCoordinator>,
    cycles: &Arc<CycleMonitor>,
    health: &Arc<CameraHealth>,
) -> TaskConfig {
    let coordinator = coordinator.clone();
    let cycles = cycles.clone();
    let health = health.clone();
    let mut last_published = 0u64;
    let mut reported = (true, true);
    timing.task(MONITOR, move || {
        report_health(Side::Left, health.is_healthy(Side::Left), &mut reported.0);
        report_health(Side::Right, health.is_healthy(Side::Right), &mut reported.1);
        let latest = coordinator.detections.read_latest();
        cycles.observe(latest.as_deref(), Instant::now());
        if let Some(snapshot) = latest {
            if snapshot.sequence != last_published {
                last_published = snapshot.sequence;
                sink.publish(&snapshot)?;
            }
        }
        Ok(())
    })
}

/// Log a camera's health only when it changes.
fn report_health(side: Side, healthy: bool, reported: &mut bool) {
    if healthy == *reported {
        return;
    }
    *reported = healthy;
    if healthy {
        log::info!("{} camera recovered", side.label());
    } else {
        log::warn!("{} camera reports unhealthy", side.label());
    }
}
