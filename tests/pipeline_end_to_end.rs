use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;

use stereo_rt::detect::{DetectionSnapshot, DetectorConfig, StubEngine};
use stereo_rt::frame::Side;
use stereo_rt::ingest::{CameraSettings, FrameSource, SyntheticCamera};
use stereo_rt::pipeline::{PipelineParts, StereoPipeline, DETECT, LEFT_CAPTURE, MONITOR, PREPROCESS, RIGHT_CAPTURE};
use stereo_rt::sink::{ConsoleSink, ResultSink};
use stereo_rt::{CpuCore, PipelineConfig, RealtimePolicy, StageTiming};

const EYE_WIDTH: u32 = 64;
const EYE_HEIGHT: u32 = 48;
const TENSOR_SIZE: u32 = 64;

#[derive(Clone, Default)]
struct RecordingSink {
    seen: Arc<Mutex<Vec<DetectionSnapshot>>>,
}

impl ResultSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn publish(&mut self, snapshot: &DetectionSnapshot) -> Result<()> {
        self.seen.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

fn small_config() -> PipelineConfig {
    let ms = Duration::from_millis;
    let mut cfg = PipelineConfig {
        cycle_budget: ms(500),
        left_capture: StageTiming::new(ms(20), 0, CpuCore::Any),
        right_capture: StageTiming::new(ms(20), 0, CpuCore::Any),
        preprocess: StageTiming::new(ms(20), 0, CpuCore::Any),
        detect: StageTiming::new(ms(40), 0, CpuCore::Any),
        monitor: StageTiming::new(ms(20), 0, CpuCore::Any),
        summary_every_cycles: 5,
        ..PipelineConfig::default()
    };
    cfg.camera = CameraSettings {
        width: EYE_WIDTH,
        height: EYE_HEIGHT,
        fps: 50,
    };
    cfg.tensor_width = TENSOR_SIZE;
    cfg.tensor_height = TENSOR_SIZE;
    cfg
}

fn detector() -> StubEngine {
    let config = DetectorConfig {
        input_width: TENSOR_SIZE,
        input_height: TENSOR_SIZE,
        ..DetectorConfig::default()
    };
    StubEngine::new(config).unwrap()
}

fn camera(camera: SyntheticCamera, device: &str) -> Box<dyn FrameSource> {
    let mut camera = camera;
    camera.open(device).unwrap();
    camera
        .configure(&CameraSettings {
            width: EYE_WIDTH,
            height: EYE_HEIGHT,
            fps: 50,
        })
        .unwrap();
    Box::new(camera)
}

#[test]
fn synthetic_rig_produces_detections_within_budget() {
    let sink = RecordingSink::default();
    let parts = PipelineParts {
        left: camera(SyntheticCamera::new("left"), "synthetic://left"),
        right: camera(SyntheticCamera::new("right").with_disparity(6), "synthetic://right"),
        engine: Box::new(detector()),
        sink: Box::new(sink.clone()),
    };
    let mut pipeline =
        StereoPipeline::new(small_config(), parts, RealtimePolicy::BestEffort).unwrap();
    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(800));
    pipeline.stop();
    assert!(!pipeline.is_running());

    let stats = pipeline.task_stats();
    let names: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, [LEFT_CAPTURE, RIGHT_CAPTURE, PREPROCESS, DETECT, MONITOR]);
    for stage in &stats {
        assert!(stage.total_executions > 0, "{} never ran", stage.name);
    }

    let seen = sink.seen.lock().unwrap();
    assert!(!seen.is_empty(), "sink received nothing");
    assert!(seen.iter().any(|snapshot| !snapshot.detections.is_empty()));
    for pair in seen.windows(2) {
        assert!(pair[1].sequence > pair[0].sequence);
    }
    for detection in seen.iter().flat_map(|s| s.detections.iter()) {
        assert_eq!(detection.class_name, "bright_object");
        assert!(detection.confidence >= 0.5);
    }

    let report = pipeline.cycle_report();
    assert!(report.cycles > 0);
    assert!(report.results >= seen.len() as u64);
    assert!(report.max_latency_us > 0);
}

#[test]
fn merged_view_keeps_both_halves_and_the_seam() {
    let parts = PipelineParts {
        left: camera(SyntheticCamera::new("left").with_noise(0), "synthetic://left"),
        right: camera(SyntheticCamera::new("right").with_noise(0), "synthetic://right"),
        engine: Box::new(detector()),
        sink: Box::new(RecordingSink::default()),
    };
    let mut pipeline =
        StereoPipeline::new(small_config(), parts, RealtimePolicy::BestEffort).unwrap();
    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(200));
    pipeline.stop();

    let merged = pipeline.coordinator().merged.read_latest().unwrap();
    assert_eq!((merged.width(), merged.height()), (2 * EYE_WIDTH, EYE_HEIGHT));
    assert!(merged.is_complete());
    for y in [0, EYE_HEIGHT / 2, EYE_HEIGHT - 1] {
        assert_eq!(merged.pixel_bgr(EYE_WIDTH - 1, y), Some([0, 255, 0]));
        assert_eq!(merged.pixel_bgr(EYE_WIDTH, y), Some([0, 255, 0]));
    }

    let tensor = pipeline.coordinator().preprocessed.read_latest().unwrap();
    assert_eq!((tensor.width(), tensor.height()), (TENSOR_SIZE, TENSOR_SIZE));
    assert!(tensor.data().iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn camera_failures_are_counted_not_fatal() {
    let parts = PipelineParts {
        left: camera(SyntheticCamera::new("left").with_failure_every(2), "synthetic://left"),
        right: camera(SyntheticCamera::new("right"), "synthetic://right"),
        engine: Box::new(detector()),
        sink: Box::new(ConsoleSink::new(Vec::new()).without_clear()),
    };
    let mut pipeline =
        StereoPipeline::new(small_config(), parts, RealtimePolicy::BestEffort).unwrap();
    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(400));
    assert!(pipeline.is_running());
    pipeline.stop();

    let stats = pipeline.task_stats();
    let left = stats.iter().find(|s| s.name == LEFT_CAPTURE).unwrap();
    let right = stats.iter().find(|s| s.name == RIGHT_CAPTURE).unwrap();
    assert!(left.failed_executions > 0);
    assert!(left.failed_executions <= left.total_executions / 2 + 1);
    assert_eq!(right.failed_executions, 0);
    let detect = stats.iter().find(|s| s.name == DETECT).unwrap();
    assert!(detect.total_executions > 0);
}

#[test]
fn dead_camera_shows_up_in_health() {
    let parts = PipelineParts {
        left: camera(SyntheticCamera::new("left"), "synthetic://left"),
        right: camera(SyntheticCamera::new("right").with_failure_every(1), "synthetic://right"),
        engine: Box::new(detector()),
        sink: Box::new(RecordingSink::default()),
    };
    let mut pipeline =
        StereoPipeline::new(small_config(), parts, RealtimePolicy::BestEffort).unwrap();
    assert!(pipeline.camera_health().is_healthy(Side::Right));
    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(150));
    pipeline.stop();

    assert!(pipeline.camera_health().is_healthy(Side::Left));
    assert!(!pipeline.camera_health().is_healthy(Side::Right));
    let stats = pipeline.task_stats();
    let right = stats.iter().find(|s| s.name == RIGHT_CAPTURE).unwrap();
    assert_eq!(right.failed_executions, right.total_executions);
}

#[test]
fn deadline_chain_over_budget_refuses_to_build() {
    let mut cfg = small_config();
    cfg.cycle_budget = Duration::from_millis(50);
    let parts = PipelineParts {
        left: camera(SyntheticCamera::new("left"), "synthetic://left"),
        right: camera(SyntheticCamera::new("right"), "synthetic://right"),
        engine: Box::new(detector()),
        sink: Box::new(RecordingSink::default()),
    };
    let err = StereoPipeline::new(cfg, parts, RealtimePolicy::BestEffort)
        .err()
        .unwrap();
    assert_eq!(err.code(), "CONFIG_ERROR");
}

#[test]
fn mismatched_detector_input_is_rejected_at_runtime() {
    let mut cfg = small_config();
    cfg.tensor_width = 32;
    cfg.tensor_height = 32;
    let parts = PipelineParts {
        left: camera(SyntheticCamera::new("left"), "synthetic://left"),
        right: camera(SyntheticCamera::new("right"), "synthetic://right"),
        engine: Box::new(detector()),
        sink: Box::new(RecordingSink::default()),
    };
    let mut pipeline = StereoPipeline::new(cfg, parts, RealtimePolicy::BestEffort).unwrap();
    pipeline.start().unwrap();
    thread::sleep(Duration::from_millis(300));
    pipeline.stop();

    let stats = pipeline.task_stats();
    let detect = stats.iter().find(|s| s.name == DETECT).unwrap();
    assert!(detect.failed_executions > 0);
    assert!(pipeline.coordinator().detections.read_latest().is_none());
}
