//! Camera sources feeding the capture stages.
//!
//! - `SyntheticCamera`: deterministic moving-target scene, always available
//! - `V4l2Camera`: local USB/V4L2 devices (feature: ingest-v4l2)
//!
//! Every source follows the same lifecycle: `open(device)`, then
//! `configure(settings)`, then `read()` once per capture period. Read
//! failures are returned to the capture stage, which counts them as failed
//! iterations without stopping.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::resource_err;
use crate::frame::Frame;

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

pub use synthetic::SyntheticCamera;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Camera;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    #[default]
    Synthetic,
    V4l2,
}

impl std::str::FromStr for CameraKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "synthetic" | "stub" => Ok(CameraKind::Synthetic),
            "v4l2" => Ok(CameraKind::V4l2),
            other => anyhow::bail!("unknown camera kind '{}' (expected synthetic or v4l2)", other),
        }
    }
}

/// Frame source collaborator.
pub trait FrameSource: Send {
    /// Human-readable label used in logs.
    fn name(&self) -> &str;

    /// Attach to the device. Errors here are fatal at startup.
    fn open(&mut self, device: &str) -> Result<()>;

    /// Request size and rate. Devices may settle on a different mode; the
    /// active size is what `read` produces.
    fn configure(&mut self, settings: &CameraSettings) -> Result<()>;

    /// Width and height `read` produces. `None` until configured.
    fn active_size(&self) -> Option<(u32, u32)>;

    /// Capture the next frame.
    fn read(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool {
        true
    }

    fn frames_captured(&self) -> u64;
}

/// Build, open and configure a camera of the requested kind.
pub fn open_camera(
    kind: CameraKind,
    label: &str,
    device: &str,
    settings: &CameraSettings,
) -> Result<Box<dyn FrameSource>> {
    let source: Box<dyn FrameSource> = match kind {
        CameraKind::Synthetic => Box::new(SyntheticCamera::new(label)),
        CameraKind::V4l2 => {
            #[cfg(feature = "ingest-v4l2")]
            {
                Box::new(V4l2Camera::new(label))
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                anyhow::bail!("v4l2 cameras require the ingest-v4l2 feature")
            }
        }
    };
    prepare(source, device, settings)
}

/// Open the left and right cameras of a rig. Synthetic rigs shift the
/// right-eye target by `synthetic_disparity` pixels.
pub fn open_stereo_pair(
    kind: CameraKind,
    left_device: &str,
    right_device: &str,
    settings: &CameraSettings,
    synthetic_disparity: u32,
) -> Result<(Box<dyn FrameSource>, Box<dyn FrameSource>)> {
    match kind {
        CameraKind::Synthetic => {
            let left = prepare(Box::new(SyntheticCamera::new("left")), left_device, settings)?;
            let right = prepare(
                Box::new(SyntheticCamera::new("right").with_disparity(synthetic_disparity)),
                right_device,
                settings,
            )?;
            Ok((left, right))
        }
        kind => Ok((
            open_camera(kind, "left", left_device, settings)?,
            open_camera(kind, "right", right_device, settings)?,
        )),
    }
}

fn prepare(
    mut source: Box<dyn FrameSource>,
    device: &str,
    settings: &CameraSettings,
) -> Result<Box<dyn FrameSource>> {
    source
        .open(device)
        .with_context(|| format!("failed to open {} camera ({})", source.name(), device))?;
    source
        .configure(settings)
        .with_context(|| format!("failed to configure {} camera", source.name()))?;
    // The merged view is sized from the requested mode.
    let requested = (settings.width, settings.height);
    match source.active_size() {
        Some(granted) if granted == requested => Ok(source),
        granted => Err(resource_err(format!(
            "{} camera delivers {} instead of the requested {}x{}",
            source.name(),
            granted
                .map(|(w, h)| format!("{}x{}", w, h))
                .unwrap_or_else(|| "no frames".to_string()),
            requested.0,
            requested.1
        ))
        .into()),
    }
}
