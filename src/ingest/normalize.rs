use anyhow::{anyhow, Result};

/// Wire formats a V4L2 device may settle on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeviceFormat {
    Rgb24,
    Bgr24,
    Yuyv,
}

impl DeviceFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(DeviceFormat::Rgb24),
            b"BGR3" => Some(DeviceFormat::Bgr24),
            b"YUYV" => Some(DeviceFormat::Yuyv),
            _ => None,
        }
    }
}

/// Convert a captured buffer into packed 8-bit RGB.
pub(crate) fn to_packed_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: DeviceFormat,
) -> Result<Vec<u8>> {
    let pixel_count = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    match format {
        DeviceFormat::Rgb24 | DeviceFormat::Bgr24 => {
            let expected = pixel_count * 3;
            // some drivers pad the final buffer
            if pixels.len() < expected {
                return Err(anyhow!(
                    "packed frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            let mut rgb = pixels[..expected].to_vec();
            if format == DeviceFormat::Bgr24 {
                for px in rgb.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
            }
            Ok(rgb)
        }
        DeviceFormat::Yuyv => yuyv_to_rgb(pixels, pixel_count),
    }
}

fn yuyv_to_rgb(pixels: &[u8], pixel_count: usize) -> Result<Vec<u8>> {
    let expected = pixel_count * 2;
    if pixel_count % 2 != 0 || pixels.len() < expected {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for quad in pixels[..expected].chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            let y = y as f32;
            rgb.push(clamp_to_u8(y + 1.402_f32 * v));
            rgb.push(clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v));
            rgb.push(clamp_to_u8(y + 1.772_f32 * u));
        }
    }
    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
