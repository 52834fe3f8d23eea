use std::time::{Duration, Instant};

use serde::Serialize;

/// Axis-aligned box in detector-input pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    pub fn intersection_over_union(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let inter = (x2 - x1).max(0) as i64 * (y2 - y1).max(0) as i64;
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub class_name: String,
}

/// Output of one detect-stage iteration as handed to the monitor/display stage.
#[derive(Clone, Debug)]
pub struct DetectionSnapshot {
    /// Monotonic per-pipeline counter, starting at 1.
    pub sequence: u64,
    pub detections: Vec<Detection>,
    /// Capture instant of the oldest camera frame behind this result.
    pub captured_at: Option<Instant>,
    pub completed_at: Instant,
    pub inference_time: Duration,
}

impl DetectionSnapshot {
    /// Capture-to-`now` latency, if the capture instant is known.
    pub fn latency_at(&self, now: Instant) -> Option<Duration> {
        self.captured_at.map(|at| now.saturating_duration_since(at))
    }
}

/// Greedy per-class non-maximum suppression.
///
/// Keeps detections in descending confidence order and drops any box whose
/// IoU with an already kept box of the same class exceeds `iou_threshold`.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id
                && k.bbox.intersection_over_union(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
