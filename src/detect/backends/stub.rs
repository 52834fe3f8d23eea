use std::time::{Duration, Instant};

use anyhow::Result;

use crate::detect::backend::{DetectorConfig, InferenceEngine};
use crate::detect::result::{non_max_suppression, BoundingBox, Detection};
use crate::error::{input_err, RtResult};
use crate::frame::TensorFrame;

const LUMINANCE_THRESHOLD: f32 = 0.8;
/// Regions smaller than this many pixels are sensor specks, not objects.
const MIN_AREA: usize = 16;
const STUB_CLASS: &str = "bright_object";

/// Model-free engine for tests and synthetic runs.
///
/// Reports every 4-connected region brighter than a luminance threshold as
/// one detection of class 0. Confidence is the region's mean luminance.
pub struct StubEngine {
    config: DetectorConfig,
    last_inference: Option<Duration>,
}

impl StubEngine {
    pub fn new(mut config: DetectorConfig) -> RtResult<Self> {
        config.validate()?;
        if config.class_names.is_empty() {
            config.class_names.push(STUB_CLASS.to_string());
        }
        Ok(Self {
            config,
            last_inference: None,
        })
    }

    fn regions(&self, frame: &TensorFrame) -> Vec<Detection> {
        let w = frame.width() as usize;
        let h = frame.height() as usize;
        let luminance: Vec<f32> = frame
            .data()
            .chunks_exact(3)
            .map(|px| 0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2])
            .collect();
        let mut visited = vec![false; w * h];
        let mut stack = Vec::new();
        let mut found = Vec::new();

        for start in 0..w * h {
            if visited[start] || luminance[start] < LUMINANCE_THRESHOLD {
                continue;
            }
            visited[start] = true;
            stack.push(start);
            let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0, 0);
            let mut area = 0usize;
            let mut sum = 0.0f32;
            while let Some(i) = stack.pop() {
                let (x, y) = (i % w, i / w);
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
                area += 1;
                sum += luminance[i];
                let mut visit = |n: usize| {
                    if !visited[n] && luminance[n] >= LUMINANCE_THRESHOLD {
                        visited[n] = true;
                        stack.push(n);
                    }
                };
                if x > 0 {
                    visit(i - 1);
                }
                if x + 1 < w {
                    visit(i + 1);
                }
                if y > 0 {
                    visit(i - w);
                }
                if y + 1 < h {
                    visit(i + w);
                }
            }
            if area < MIN_AREA {
                continue;
            }
            let confidence = (sum / area as f32).clamp(0.0, 1.0);
            if confidence < self.config.confidence_threshold {
                continue;
            }
            found.push(Detection {
                class_id: 0,
                confidence,
                bbox: BoundingBox::new(
                    min_x as i32,
                    min_y as i32,
                    (max_x - min_x + 1) as i32,
                    (max_y - min_y + 1) as i32,
                ),
                class_name: self.config.class_name(0),
            });
        }
        found
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &TensorFrame) -> Result<Vec<Detection>> {
        if frame.width() != self.config.input_width || frame.height() != self.config.input_height {
            return Err(input_err(format!(
                "tensor {}x{} does not match detector input {}x{}",
                frame.width(),
                frame.height(),
                self.config.input_width,
                self.config.input_height
            ))
            .into());
        }
        let started = Instant::now();
        let found = self.regions(frame);
        let kept = non_max_suppression(found, self.config.nms_threshold);
        self.last_inference = Some(started.elapsed());
        Ok(kept)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = TensorFrame::new(
            self.config.input_width,
            self.config.input_height,
            vec![0.0; self.config.input_width as usize * self.config.input_height as usize * 3],
        )?;
        self.detect(&blank)?;
        log::debug!("StubEngine: warm-up finished");
        Ok(())
    }

    fn last_inference_time(&self) -> Option<Duration> {
        self.last_inference
    }
}
