//! V4L2 camera.
//!
//! `open` attaches to the device node (`/dev/videoN`, or a bare index `N`).
//! `configure` negotiates size, format and rate, then maps the capture
//! buffers. Frames are converted to packed RGB in memory.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::normalize::{to_packed_rgb, DeviceFormat};
use super::{CameraSettings, FrameSource};
use crate::frame::{Frame, PixelFormat};

const MMAP_BUFFERS: u32 = 4;
const MIN_STALE_AFTER: Duration = Duration::from_secs(2);
/// Frame intervals without a capture before the camera reports unhealthy.
const STALE_FRAMES: u32 = 6;

pub struct V4l2Camera {
    label: String,
    node: Option<String>,
    idle: Option<v4l::Device>,
    mapped: Option<MappedDevice>,
    requested: CameraSettings,
    mode: Option<CaptureMode>,
    captured: u64,
    last_capture: Option<Instant>,
    fault: Option<String>,
}

/// Size and pixel layout the driver settled on.
#[derive(Clone, Copy, Debug)]
struct CaptureMode {
    width: u32,
    height: u32,
    layout: DeviceFormat,
}

#[self_referencing]
struct MappedDevice {
    node: v4l::Device,
    #[borrows(mut node)]
    #[covariant]
    buffers: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// `"2"` becomes `/dev/video2`; anything else is taken as a path.
pub fn device_path(device: &str) -> String {
    let trimmed = device.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        format!("/dev/video{}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Ask for packed RGB at the requested size and accept whatever layout
/// the driver answers with, as long as it can be converted. A different
/// size is reported through `active_size` and refused when the rig opens.
fn negotiate(device: &v4l::Device, node: &str, settings: &CameraSettings) -> Result<CaptureMode> {
    use v4l::video::Capture;

    let mut wanted = device
        .format()
        .with_context(|| format!("query capture format of {}", node))?;
    wanted.width = settings.width;
    wanted.height = settings.height;
    wanted.fourcc = v4l::FourCC::new(b"RGB3");
    let granted = device.set_format(&wanted).or_else(|err| {
        log::warn!("V4l2Camera: {} refused {}x{} RGB3: {}", node, settings.width, settings.height, err);
        device.format()
    })?;
    let layout = DeviceFormat::from_fourcc(&granted.fourcc.repr).ok_or_else(|| {
        anyhow!("{} only offers {}, which cannot be converted", node, granted.fourcc)
    })?;

    if settings.fps > 0 {
        let rate = v4l::video::capture::Parameters::with_fps(settings.fps);
        if let Err(err) = device.set_params(&rate) {
            log::warn!("V4l2Camera: {} kept its frame rate ({})", node, err);
        }
    }
    Ok(CaptureMode {
        width: granted.width,
        height: granted.height,
        layout,
    })
}

impl V4l2Camera {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            node: None,
            idle: None,
            mapped: None,
            requested: CameraSettings::default(),
            mode: None,
            captured: 0,
            last_capture: None,
            fault: None,
        }
    }

    fn stale_after(&self) -> Duration {
        match self.requested.fps {
            0 => MIN_STALE_AFTER,
            fps => (Duration::from_secs(1) / fps * STALE_FRAMES).max(MIN_STALE_AFTER),
        }
    }

    /// Take the device back, unmapping its buffers if it was streaming.
    fn release_device(&mut self) -> Option<v4l::Device> {
        self.idle
            .take()
            .or_else(|| self.mapped.take().map(|mapped| mapped.into_heads().node))
    }
}

impl FrameSource for V4l2Camera {
    fn name(&self) -> &str {
        &self.label
    }

    fn open(&mut self, device: &str) -> Result<()> {
        let node = device_path(device);
        let handle = v4l::Device::with_path(&node)
            .with_context(|| format!("open v4l2 device {}", node))?;
        log::info!("V4l2Camera: {} attached to {}", self.label, node);
        self.mapped = None;
        self.mode = None;
        self.idle = Some(handle);
        self.node = Some(node);
        Ok(())
    }

    fn configure(&mut self, settings: &CameraSettings) -> Result<()> {
        let device = self
            .release_device()
            .ok_or_else(|| anyhow!("v4l2 camera '{}' is not open", self.label))?;
        let node = self.node.clone().unwrap_or_default();
        let mode = negotiate(&device, &node, settings)?;

        let mapped = MappedDeviceBuilder {
            node: device,
            buffers_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(
                    device,
                    v4l::buffer::Type::VideoCapture,
                    MMAP_BUFFERS,
                )
                .with_context(|| format!("map {} capture buffers", MMAP_BUFFERS))
            },
        }
        .try_build();
        let mapped = match mapped {
            Ok(mapped) => mapped,
            Err(err) => {
                self.fault = Some(format!("{:#}", err));
                return Err(err);
            }
        };

        log::info!(
            "V4l2Camera: {} capturing {}x{} {:?} from {}",
            self.label,
            mode.width,
            mode.height,
            mode.layout,
            node
        );
        self.requested = *settings;
        self.mode = Some(mode);
        self.mapped = Some(mapped);
        self.fault = None;
        Ok(())
    }

    fn active_size(&self) -> Option<(u32, u32)> {
        self.mode.map(|mode| (mode.width, mode.height))
    }

    fn read(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let (Some(mapped), Some(mode)) = (self.mapped.as_mut(), self.mode) else {
            return Err(anyhow!("v4l2 camera '{}' is not configured", self.label));
        };
        let dequeued = mapped.with_buffers_mut(|buffers| buffers.next());
        let (raw, _meta) = match dequeued {
            Ok(buffer) => buffer,
            Err(err) => {
                self.fault = Some(err.to_string());
                return Err(anyhow::Error::new(err).context("dequeue v4l2 buffer"));
            }
        };
        let rgb = to_packed_rgb(raw, mode.width, mode.height, mode.layout)?;
        let frame = Frame::new(mode.width, mode.height, PixelFormat::Rgb8, rgb)?;

        self.captured += 1;
        self.last_capture = Some(Instant::now());
        self.fault = None;
        Ok(frame.with_sequence(self.captured))
    }

    fn is_healthy(&self) -> bool {
        self.fault.is_none()
            && self
                .last_capture
                .is_none_or(|at| at.elapsed() <= self.stale_after())
    }

    fn frames_captured(&self) -> u64 {
        self.captured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_index_maps_to_device_node() {
        assert_eq!(device_path("2"), "/dev/video2");
        assert_eq!(device_path("/dev/video7"), "/dev/video7");
    }

    #[test]
    fn read_before_configure_fails() {
        let mut camera = V4l2Camera::new("left");
        assert!(camera.read().is_err());
        assert!(camera.configure(&CameraSettings::default()).is_err());
        assert_eq!(camera.active_size(), None);
        assert!(camera.is_healthy());
    }

    #[test]
    fn staleness_scales_with_frame_rate() {
        let mut camera = V4l2Camera::new("left");
        camera.requested.fps = 1;
        assert_eq!(camera.stale_after(), Duration::from_secs(6));
        camera.requested.fps = 30;
        assert_eq!(camera.stale_after(), MIN_STALE_AFTER);
    }
}
