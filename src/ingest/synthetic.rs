//! Synthetic camera.
//!
//! Produces a dark gradient background with light sensor noise and a bright
//! square that slides horizontally one step per frame. A right-eye camera can
//! be given a disparity so the two halves of a stereo pair differ the way a
//! real rig would.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{CameraSettings, FrameSource};
use crate::frame::{Frame, PixelFormat};

const TARGET_BGR: [u8; 3] = [240, 240, 240];
const TARGET_STEP_PX: u32 = 8;
const DEFAULT_NOISE: u8 = 4;

pub struct SyntheticCamera {
    label: String,
    device: Option<String>,
    settings: CameraSettings,
    configured: bool,
    dropped_last: bool,
    frame_count: u64,
    disparity: u32,
    noise: u8,
    capture_delay: Option<Duration>,
    fail_every: Option<u64>,
    rng: StdRng,
}

impl SyntheticCamera {
    pub fn new(label: &str) -> Self {
        let seed = label.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        Self {
            label: label.to_string(),
            device: None,
            settings: CameraSettings::default(),
            configured: false,
            dropped_last: false,
            frame_count: 0,
            disparity: 0,
            noise: DEFAULT_NOISE,
            capture_delay: None,
            fail_every: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Horizontal shift of the target, in pixels.
    pub fn with_disparity(mut self, pixels: u32) -> Self {
        self.disparity = pixels;
        self
    }

    pub fn with_noise(mut self, amplitude: u8) -> Self {
        self.noise = amplitude;
        self
    }

    /// Block inside `read` to emulate exposure and transfer time.
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = Some(delay);
        self
    }

    /// Make every `n`-th read fail.
    pub fn with_failure_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    /// Top-left corner and edge of the target in the next frame.
    pub fn target_rect(&self, frame_index: u64) -> (u32, u32, u32) {
        let CameraSettings { width, height, .. } = self.settings;
        let size = (height / 6).max(4).min(width).min(height);
        let travel = width.saturating_sub(size).max(1) as u64;
        let x = ((frame_index * TARGET_STEP_PX as u64 + self.disparity as u64) % travel) as u32;
        let y = (height / 3).min(height - size);
        (x, y, size)
    }

    fn render(&mut self) -> Vec<u8> {
        let CameraSettings { width, height, .. } = self.settings;
        let (tx, ty, size) = self.target_rect(self.frame_count);
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for y in 0..height {
            for x in 0..width {
                if x >= tx && x < tx + size && y >= ty && y < ty + size {
                    pixels.extend_from_slice(&TARGET_BGR);
                    continue;
                }
                let base = (40 + x * 80 / width.max(1)) as i16;
                let n = if self.noise == 0 {
                    0
                } else {
                    self.rng.gen_range(-(self.noise as i16)..=self.noise as i16)
                };
                let v = (base + n).clamp(0, 255) as u8;
                pixels.extend_from_slice(&[v, v / 2 + 20, v / 3]);
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticCamera {
    fn name(&self) -> &str {
        &self.label
    }

    fn open(&mut self, device: &str) -> Result<()> {
        if device.trim().is_empty() {
            return Err(anyhow!("synthetic camera '{}' needs a device name", self.label));
        }
        self.device = Some(device.to_string());
        log::info!("SyntheticCamera: {} opened {}", self.label, device);
        Ok(())
    }

    fn configure(&mut self, settings: &CameraSettings) -> Result<()> {
        if settings.width == 0 || settings.height == 0 {
            return Err(anyhow!(
                "camera size {}x{} is not valid",
                settings.width,
                settings.height
            ));
        }
        self.settings = *settings;
        self.configured = true;
        Ok(())
    }

    fn active_size(&self) -> Option<(u32, u32)> {
        self.configured
            .then_some((self.settings.width, self.settings.height))
    }

    fn read(&mut self) -> Result<Frame> {
        if self.device.is_none() {
            return Err(anyhow!("synthetic camera '{}' is not open", self.label));
        }
        if let Some(delay) = self.capture_delay {
            thread::sleep(delay);
        }
        self.frame_count += 1;
        self.dropped_last = self
            .fail_every
            .is_some_and(|n| self.frame_count.is_multiple_of(n));
        if self.dropped_last {
            return Err(anyhow!(
                "synthetic camera '{}' dropped frame {}",
                self.label,
                self.frame_count
            ));
        }
        let pixels = self.render();
        let frame = Frame::new(
            self.settings.width,
            self.settings.height,
            PixelFormat::Bgr8,
            pixels,
        )?;
        Ok(frame.with_sequence(self.frame_count))
    }

    /// Unhealthy while the latest read was a dropped frame.
    fn is_healthy(&self) -> bool {
        !self.dropped_last
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}
