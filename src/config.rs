use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::context::RealtimePolicy;
use crate::detect::DetectorConfig;
use crate::ingest::CameraKind;
use crate::pipeline::{PipelineConfig, StageTiming};
use crate::task::CpuCore;

pub const CONFIG_ENV: &str = "STEREO_RT_CONFIG";
const DEFAULT_LEFT_DEVICE: &str = "0";
const DEFAULT_RIGHT_DEVICE: &str = "2";
const DEFAULT_DISPARITY_PX: u32 = 12;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DaemonConfigFile {
    camera: Option<CameraConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    detector: Option<DetectorConfigFile>,
    strict_realtime: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    kind: Option<CameraKind>,
    left_device: Option<String>,
    right_device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    synthetic_disparity_px: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PipelineConfigFile {
    cycle_ms: Option<u64>,
    summary_every_cycles: Option<u64>,
    /// Drop every core pin and realtime priority (development hosts).
    unpinned: Option<bool>,
    left_capture: Option<StageConfigFile>,
    right_capture: Option<StageConfigFile>,
    preprocess: Option<StageConfigFile>,
    detect: Option<StageConfigFile>,
    monitor: Option<StageConfigFile>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
#[serde(deny_unknown_fields)]
struct StageConfigFile {
    period_ms: Option<u64>,
    deadline_ms: Option<u64>,
    priority: Option<u8>,
    /// Core index. `any_core = true` wins over it.
    core: Option<usize>,
    any_core: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    class_names: Option<Vec<String>>,
    confidence_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    input_width: Option<u32>,
    input_height: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub camera_kind: CameraKind,
    pub left_device: String,
    pub right_device: String,
    /// Target shift between the two synthetic cameras.
    pub synthetic_disparity_px: u32,
    pub pipeline: PipelineConfig,
    pub detector: DetectorConfig,
    pub policy: RealtimePolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::from_file(DaemonConfigFile::default())
    }
}

impl DaemonConfig {
    /// File named by `STEREO_RT_CONFIG` (if any), then env overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with an explicit file taking the place of `STEREO_RT_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => DaemonConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DaemonConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let pipeline_file = file.pipeline.unwrap_or_default();
        let detector_file = file.detector.unwrap_or_default();

        let mut detector = DetectorConfig::default();
        if let Some(path) = detector_file.model_path {
            detector.model_path = Some(path);
        }
        if let Some(names) = detector_file.class_names {
            detector.class_names = names;
        }
        detector.confidence_threshold = detector_file
            .confidence_threshold
            .unwrap_or(detector.confidence_threshold);
        detector.nms_threshold = detector_file
            .nms_threshold
            .unwrap_or(detector.nms_threshold);
        detector.input_width = detector_file.input_width.unwrap_or(detector.input_width);
        detector.input_height = detector_file.input_height.unwrap_or(detector.input_height);

        let mut pipeline = PipelineConfig::default();
        if pipeline_file.unpinned.unwrap_or(false) {
            pipeline = pipeline.unpinned();
        }
        if let Some(ms) = pipeline_file.cycle_ms {
            pipeline.cycle_budget = Duration::from_millis(ms);
        }
        if let Some(every) = pipeline_file.summary_every_cycles {
            pipeline.summary_every_cycles = every;
        }
        apply_stage(&mut pipeline.left_capture, pipeline_file.left_capture);
        apply_stage(&mut pipeline.right_capture, pipeline_file.right_capture);
        apply_stage(&mut pipeline.preprocess, pipeline_file.preprocess);
        apply_stage(&mut pipeline.detect, pipeline_file.detect);
        apply_stage(&mut pipeline.monitor, pipeline_file.monitor);
        pipeline.camera.width = camera.width.unwrap_or(pipeline.camera.width);
        pipeline.camera.height = camera.height.unwrap_or(pipeline.camera.height);
        pipeline.camera.fps = camera.fps.unwrap_or(pipeline.camera.fps);

        let policy = if file.strict_realtime.unwrap_or(false) {
            RealtimePolicy::Strict
        } else {
            RealtimePolicy::BestEffort
        };

        Self {
            camera_kind: camera.kind.unwrap_or_default(),
            left_device: camera
                .left_device
                .unwrap_or_else(|| DEFAULT_LEFT_DEVICE.to_string()),
            right_device: camera
                .right_device
                .unwrap_or_else(|| DEFAULT_RIGHT_DEVICE.to_string()),
            synthetic_disparity_px: camera
                .synthetic_disparity_px
                .unwrap_or(DEFAULT_DISPARITY_PX),
            pipeline,
            detector,
            policy,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("STEREO_RT_LEFT_DEVICE") {
            if !device.trim().is_empty() {
                self.left_device = device;
            }
        }
        if let Ok(device) = std::env::var("STEREO_RT_RIGHT_DEVICE") {
            if !device.trim().is_empty() {
                self.right_device = device;
            }
        }
        if let Ok(kind) = std::env::var("STEREO_RT_CAMERA") {
            if !kind.trim().is_empty() {
                self.camera_kind = kind.parse()?;
            }
        }
        if let Ok(cycle) = std::env::var("STEREO_RT_CYCLE_MS") {
            let ms: u64 = cycle.trim().parse().map_err(|_| {
                anyhow!("STEREO_RT_CYCLE_MS must be an integer number of milliseconds")
            })?;
            self.pipeline.cycle_budget = Duration::from_millis(ms);
        }
        if let Ok(strict) = std::env::var("STEREO_RT_STRICT_RT") {
            self.policy = if parse_flag("STEREO_RT_STRICT_RT", &strict)? {
                RealtimePolicy::Strict
            } else {
                RealtimePolicy::BestEffort
            };
        }
        if let Ok(path) = std::env::var("STEREO_RT_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.detector.model_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.left_device.trim().is_empty() || self.right_device.trim().is_empty() {
            return Err(anyhow!("camera devices must not be empty"));
        }
        self.detector.validate()?;
        self.pipeline.tensor_width = self.detector.input_width;
        self.pipeline.tensor_height = self.detector.input_height;
        self.pipeline.validate()?;
        Ok(())
    }
}

fn apply_stage(stage: &mut StageTiming, file: Option<StageConfigFile>) {
    let Some(file) = file else {
        return;
    };
    if let Some(ms) = file.period_ms {
        stage.period = Duration::from_millis(ms);
        if file.deadline_ms.is_none() {
            stage.deadline = stage.period;
        }
    }
    if let Some(ms) = file.deadline_ms {
        stage.deadline = Duration::from_millis(ms);
    }
    if let Some(priority) = file.priority {
        stage.priority = priority;
    }
    if file.any_core.unwrap_or(false) {
        stage.core = CpuCore::Any;
    } else if let Some(core) = file.core {
        stage.core = CpuCore::Pinned(core);
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", name, other)),
    }
}

fn read_config_file(path: &Path) -> Result<DaemonConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
