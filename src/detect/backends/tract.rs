#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectorConfig, InferenceEngine};
use crate::detect::result::{non_max_suppression, BoundingBox, Detection};
use crate::error::input_err;
use crate::frame::TensorFrame;

/// ONNX inference through tract for YOLO-style detectors.
///
/// Expects one input of shape `[1, 3, H, W]` and one output of shape
/// `[1, N, 5 + C]` where each row is `cx, cy, w, h, objectness, class scores...`
/// in input-pixel units. The model is loaded from a local file; no network I/O.
pub struct TractEngine {
    model: TypedRunnableModel<TypedModel>,
    config: DetectorConfig,
    last_inference: Option<Duration>,
}

impl TractEngine {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        config.validate()?;
        let model_path = config
            .model_path
            .clone()
            .ok_or_else(|| anyhow!("tract engine requires a model path"))?;
        let model = Self::load(&model_path, config.input_width, config.input_height)?;
        log::info!(
            "TractEngine: loaded {} ({}x{})",
            model_path.display(),
            config.input_width,
            config.input_height
        );
        Ok(Self {
            model,
            config,
            last_inference: None,
        })
    }

    fn load(
        model_path: &Path,
        width: u32,
        height: u32,
    ) -> Result<TypedRunnableModel<TypedModel>> {
        tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")
    }

    fn build_input(&self, frame: &TensorFrame) -> Result<Tensor> {
        if frame.width() != self.config.input_width || frame.height() != self.config.input_height {
            return Err(input_err(format!(
                "tensor {}x{} does not match model input {}x{}",
                frame.width(),
                frame.height(),
                self.config.input_width,
                self.config.input_height
            ))
            .into());
        }
        let shape = [1, 3, frame.height() as usize, frame.width() as usize];
        let input = tract_ndarray::Array4::from_shape_vec(shape, frame.to_planar())
            .context("planar tensor has unexpected length")?;
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let rows = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = rows.shape().to_vec();
        if shape.len() != 3 || shape[2] < 6 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let rows = rows
            .into_shape((shape[1], shape[2]))
            .context("reshape detector output")?;

        let mut found = Vec::new();
        for row in rows.outer_iter() {
            let objectness = row[4];
            let (class_id, class_score) = row
                .iter()
                .skip(5)
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, s)| if s > best.1 { (i, s) } else { best });
            let confidence = objectness * class_score;
            if !confidence.is_finite() || confidence < self.config.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            found.push(Detection {
                class_id,
                confidence: confidence.clamp(0.0, 1.0),
                bbox: BoundingBox::new(
                    (cx - w / 2.0).round() as i32,
                    (cy - h / 2.0).round() as i32,
                    w.round() as i32,
                    h.round() as i32,
                ),
                class_name: self.config.class_name(class_id),
            });
        }
        Ok(non_max_suppression(found, self.config.nms_threshold))
    }
}

impl InferenceEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &TensorFrame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let started = Instant::now();
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.last_inference = Some(started.elapsed());
        self.decode(outputs)
    }

    fn warm_up(&mut self) -> Result<()> {
        let (w, h) = (self.config.input_width, self.config.input_height);
        let blank = TensorFrame::new(w, h, vec![0.0; w as usize * h as usize * 3])?;
        self.detect(&blank)?;
        log::info!(
            "TractEngine: warm-up inference took {:?}",
            self.last_inference.unwrap_or_default()
        );
        Ok(())
    }

    fn last_inference_time(&self) -> Option<Duration> {
        self.last_inference
    }
}
