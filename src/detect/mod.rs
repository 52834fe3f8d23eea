mod backend;
mod backends;
mod result;

use anyhow::Result;

pub use backend::{
    DetectorConfig, InferenceEngine, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_NMS_THRESHOLD,
};
pub use backends::StubEngine;
#[cfg(feature = "backend-tract")]
pub use backends::TractEngine;
pub use result::{non_max_suppression, BoundingBox, Detection, DetectionSnapshot};

/// Pick an engine for `config`: tract when a model path is set and the
/// backend is compiled in, the stub otherwise.
pub fn build_engine(config: &DetectorConfig) -> Result<Box<dyn InferenceEngine>> {
    config.validate()?;
    match &config.model_path {
        #[cfg(feature = "backend-tract")]
        Some(_) => Ok(Box::new(TractEngine::new(config.clone())?)),
        #[cfg(not(feature = "backend-tract"))]
        Some(path) => anyhow::bail!(
            "model {} requires the backend-tract feature",
            path.display()
        ),
        None => {
            log::info!("no model configured, using stub bright-region detector");
            Ok(Box::new(StubEngine::new(config.clone())?))
        }
    }
}
