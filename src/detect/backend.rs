use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::detect::result::Detection;
use crate::error::{config_err, RtResult};
use crate::frame::{TensorFrame, DETECTOR_INPUT_SIZE};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

/// Construction-time detector settings.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorConfig {
    pub model_path: Option<PathBuf>,
    /// Index = class id. Missing names render as `class_<id>`.
    pub class_names: Vec<String>,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub input_width: u32,
    pub input_height: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            class_names: Vec::new(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
            input_width: DETECTOR_INPUT_SIZE,
            input_height: DETECTOR_INPUT_SIZE,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> RtResult<()> {
        for (name, value) in [
            ("confidence threshold", self.confidence_threshold),
            ("nms threshold", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(config_err(format!(
                    "{} {} outside [0, 1]",
                    name, value
                )));
            }
        }
        if self.input_width == 0 || self.input_height == 0 {
            return Err(config_err(format!(
                "detector input size {}x{} is not valid",
                self.input_width, self.input_height
            )));
        }
        Ok(())
    }

    pub fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class_id))
    }
}

/// Inference engine collaborator.
///
/// Implementations reject tensors whose size differs from their configured
/// input with `RtError::Input`.
pub trait InferenceEngine: Send {
    fn name(&self) -> &'static str;

    /// Detections above the confidence threshold, after NMS, best first.
    fn detect(&mut self, frame: &TensorFrame) -> Result<Vec<Detection>>;

    /// Run once on dummy input before the pipeline starts.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    /// Duration of the most recent `detect` call.
    fn last_inference_time(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(DetectorConfig::default().validate().is_ok());
    }

    #[test]
    fn thresholds_outside_unit_range_are_config_errors() {
        for (conf, nms) in [(1.5, 0.4), (-0.1, 0.4), (0.5, 1.01), (f32::NAN, 0.4)] {
            let config = DetectorConfig {
                confidence_threshold: conf,
                nms_threshold: nms,
                ..DetectorConfig::default()
            };
            assert!(config.validate().unwrap_err().is_config(), "{} {}", conf, nms);
        }
    }

    #[test]
    fn unnamed_classes_get_placeholder() {
        let config = DetectorConfig {
            class_names: vec!["person".to_string()],
            ..DetectorConfig::default()
        };
        assert_eq!(config.class_name(0), "person");
        assert_eq!(config.class_name(3), "class_3");
    }
}
