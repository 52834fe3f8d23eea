//! Pixel containers passed between pipeline stages.
//!
//! - `Frame`: one packed 8-bit, 3-channel image as delivered by a camera.
//! - `StereoFrame`: side-by-side merge of a left and right `Frame` with a
//!   vertical separator at the seam. Each half carries its own capture stamp.
//! - `TensorFrame`: detector input. RGB, `f32` in `[0, 1]`, fixed size.
//!
//! Invalid frames (zero dimensions, short buffers, size mismatches) are
//! reported as `RtError::Input`.

use std::time::Instant;

use crate::error::{input_err, RtResult};

pub const CHANNELS: usize = 3;

/// Width in pixels of the seam drawn between the two halves.
pub const SEPARATOR_WIDTH: u32 = 2;

/// Seam colour in BGR order (green).
pub const SEPARATOR_BGR: [u8; 3] = [0, 255, 0];

/// Square detector input edge used by the default pipeline.
pub const DETECTOR_INPUT_SIZE: u32 = 416;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Bgr8,
    Rgb8,
}

fn byte_len(width: u32, height: u32) -> RtResult<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(CHANNELS))
        .ok_or_else(|| input_err(format!("frame dimensions {}x{} overflow", width, height)))
}

#[derive(Clone, Debug)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    sequence: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> RtResult<Self> {
        if width == 0 || height == 0 {
            return Err(input_err(format!(
                "frame has no valid dimensions ({}x{})",
                width, height
            )));
        }
        let expected = byte_len(width, height)?;
        if data.len() != expected {
            return Err(input_err(format!(
                "expected {} bytes for {}x{} frame, received {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            data,
            sequence: 0,
            captured_at: Instant::now(),
        })
    }

    /// Uniform frame, mostly for tests and warm-up.
    pub fn filled(width: u32, height: u32, format: PixelFormat, pixel: [u8; 3]) -> RtResult<Self> {
        let len = byte_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..len / CHANNELS {
            data.extend_from_slice(&pixel);
        }
        Self::new(width, height, format, data)
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_captured_at(mut self, captured_at: Instant) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * CHANNELS
    }

    /// Pixel at `(x, y)` in the frame's own channel order.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.offset(x, y);
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    /// Pixel at `(x, y)` in BGR order regardless of storage format.
    pub fn pixel_bgr(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        let [a, b, c] = self.pixel(x, y)?;
        Some(match self.format {
            PixelFormat::Bgr8 => [a, b, c],
            PixelFormat::Rgb8 => [c, b, a],
        })
    }

    fn row(&self, y: u32) -> &[u8] {
        let start = self.offset(0, y);
        &self.data[start..start + self.width as usize * CHANNELS]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    fn bit(self) -> u8 {
        match self {
            Side::Left => 0b01,
            Side::Right => 0b10,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

/// Capture identity of one half of a `StereoFrame`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HalfStamp {
    pub sequence: u64,
    pub captured_at: Instant,
}

/// Side-by-side stereo canvas, `2 * eye_width` by `height`, stored as BGR.
#[derive(Clone, Debug)]
pub struct StereoFrame {
    canvas: Vec<u8>,
    eye_width: u32,
    height: u32,
    left: Option<HalfStamp>,
    right: Option<HalfStamp>,
    fresh: u8,
}

impl StereoFrame {
    /// Black canvas for two `eye_width` x `height` cameras.
    pub fn new(eye_width: u32, height: u32) -> RtResult<Self> {
        if eye_width == 0 || height == 0 {
            return Err(input_err(format!(
                "stereo eye has no valid dimensions ({}x{})",
                eye_width, height
            )));
        }
        let canvas_width = eye_width
            .checked_mul(2)
            .ok_or_else(|| input_err("stereo canvas width overflows"))?;
        let len = byte_len(canvas_width, height)?;
        Ok(Self {
            canvas: vec![0; len],
            eye_width,
            height,
            left: None,
            right: None,
            fresh: 0,
        })
    }

    pub fn eye_width(&self) -> u32 {
        self.eye_width
    }

    pub fn width(&self) -> u32 {
        self.eye_width * 2
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Copy `frame` into its half of the canvas and redraw the seam.
    pub fn update_half(&mut self, side: Side, frame: &Frame) -> RtResult<()> {
        if frame.width() != self.eye_width || frame.height() != self.height {
            return Err(input_err(format!(
                "{} frame is {}x{}, stereo eye expects {}x{}",
                side.label(),
                frame.width(),
                frame.height(),
                self.eye_width,
                self.height
            )));
        }

        let canvas_stride = self.width() as usize * CHANNELS;
        let half_bytes = self.eye_width as usize * CHANNELS;
        let x_offset = match side {
            Side::Left => 0,
            Side::Right => half_bytes,
        };
        for y in 0..self.height {
            let dst_start = y as usize * canvas_stride + x_offset;
            let dst = &mut self.canvas[dst_start..dst_start + half_bytes];
            let src = frame.row(y);
            match frame.format() {
                PixelFormat::Bgr8 => dst.copy_from_slice(src),
                PixelFormat::Rgb8 => {
                    for (d, s) in dst.chunks_exact_mut(CHANNELS).zip(src.chunks_exact(CHANNELS)) {
                        d[0] = s[2];
                        d[1] = s[1];
                        d[2] = s[0];
                    }
                }
            }
        }
        self.draw_separator();

        let stamp = HalfStamp {
            sequence: frame.sequence(),
            captured_at: frame.captured_at(),
        };
        match side {
            Side::Left => self.left = Some(stamp),
            Side::Right => self.right = Some(stamp),
        }
        self.fresh |= side.bit();
        Ok(())
    }

    fn draw_separator(&mut self) {
        let canvas_width = self.width();
        let first = self.eye_width.saturating_sub(SEPARATOR_WIDTH / 2);
        let last = (first + SEPARATOR_WIDTH).min(canvas_width);
        for y in 0..self.height {
            for x in first..last {
                let i = (y as usize * canvas_width as usize + x as usize) * CHANNELS;
                self.canvas[i..i + CHANNELS].copy_from_slice(&SEPARATOR_BGR);
            }
        }
    }

    /// True once both halves have been refreshed since the last call that
    /// returned true. Resets the freshness mask when it fires.
    pub fn take_fresh_pair(&mut self) -> bool {
        if self.fresh == Side::Left.bit() | Side::Right.bit() {
            self.fresh = 0;
            true
        } else {
            false
        }
    }

    pub fn is_complete(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }

    /// Capture instant of the older half: the age of the merged view.
    pub fn oldest_capture(&self) -> Option<Instant> {
        match (self.left, self.right) {
            (Some(l), Some(r)) => Some(l.captured_at.min(r.captured_at)),
            (Some(one), None) | (None, Some(one)) => Some(one.captured_at),
            (None, None) => None,
        }
    }

    pub fn pixel_bgr(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width() || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width() as usize + x as usize) * CHANNELS;
        Some([self.canvas[i], self.canvas[i + 1], self.canvas[i + 2]])
    }

    fn as_source(&self) -> Source<'_> {
        Source {
            data: &self.canvas,
            width: self.width(),
            height: self.height,
            format: PixelFormat::Bgr8,
        }
    }
}

struct Source<'a> {
    data: &'a [u8],
    width: u32,
    height: u32,
    format: PixelFormat,
}

/// Detector input: packed RGB `f32` samples in `[0, 1]`, row-major HWC.
#[derive(Clone, Debug)]
pub struct TensorFrame {
    width: u32,
    height: u32,
    data: Vec<f32>,
    captured_at: Option<Instant>,
}

impl TensorFrame {
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> RtResult<Self> {
        if width == 0 || height == 0 {
            return Err(input_err(format!(
                "tensor has no valid dimensions ({}x{})",
                width, height
            )));
        }
        let expected = byte_len(width, height)?;
        if data.len() != expected {
            return Err(input_err(format!(
                "expected {} samples for {}x{} tensor, received {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
            captured_at: None,
        })
    }

    /// Nearest-neighbour resize to `width` x `height`, convert to RGB, scale by 1/255.
    pub fn from_frame(frame: &Frame, width: u32, height: u32) -> RtResult<Self> {
        let source = Source {
            data: frame.data(),
            width: frame.width(),
            height: frame.height(),
            format: frame.format(),
        };
        let mut tensor = Self::preprocess(&source, width, height)?;
        tensor.captured_at = Some(frame.captured_at());
        Ok(tensor)
    }

    pub fn from_stereo(stereo: &StereoFrame, width: u32, height: u32) -> RtResult<Self> {
        let mut tensor = Self::preprocess(&stereo.as_source(), width, height)?;
        tensor.captured_at = stereo.oldest_capture();
        Ok(tensor)
    }

    fn preprocess(source: &Source<'_>, width: u32, height: u32) -> RtResult<Self> {
        if width == 0 || height == 0 {
            return Err(input_err(format!(
                "target size {}x{} is not valid",
                width, height
            )));
        }
        let len = byte_len(width, height)?;
        let (r, g, b) = match source.format {
            PixelFormat::Bgr8 => (2, 1, 0),
            PixelFormat::Rgb8 => (0, 1, 2),
        };
        let src_w = source.width as u64;
        let src_h = source.height as u64;
        let mut data = Vec::with_capacity(len);
        for y in 0..height as u64 {
            let sy = (y * src_h / height as u64) as usize;
            for x in 0..width as u64 {
                let sx = (x * src_w / width as u64) as usize;
                let i = (sy * source.width as usize + sx) * CHANNELS;
                let px = &source.data[i..i + CHANNELS];
                data.push(px[r] as f32 / 255.0);
                data.push(px[g] as f32 / 255.0);
                data.push(px[b] as f32 / 255.0);
            }
        }
        Self::new(width, height, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Capture instant of the oldest camera frame that fed this tensor.
    pub fn captured_at(&self) -> Option<Instant> {
        self.captured_at
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[f32; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    /// Planar copy (`C`, `H`, `W`) for engines that want NCHW input.
    pub fn to_planar(&self) -> Vec<f32> {
        let plane = self.width as usize * self.height as usize;
        let mut out = vec![0.0; plane * CHANNELS];
        for (i, px) in self.data.chunks_exact(CHANNELS).enumerate() {
            for (c, value) in px.iter().enumerate() {
                out[c * plane + i] = *value;
            }
        }
        out
    }
}
