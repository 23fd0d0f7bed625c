use anyhow::{anyhow, Result};

/// Pixel layouts a camera may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    /// Packed 4:2:2, `Y0 U Y1 V`. The default for most USB webcams.
    Yuyv,
    Nv12,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"NV12" => Some(PixelFormat::Nv12),
            _ => None,
        }
    }
}

pub(crate) fn to_rgb(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>> {
    let area = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    match format {
        PixelFormat::Rgb24 => {
            let expected = area * 3;
            check_len("RGB", pixels, expected)?;
            Ok(pixels[..expected].to_vec())
        }
        PixelFormat::Yuyv => {
            check_len("YUYV", pixels, area * 2)?;
            Ok(yuyv_to_rgb(pixels, area))
        }
        PixelFormat::Nv12 => {
            check_len("NV12", pixels, area + area / 2)?;
            Ok(nv12_to_rgb(pixels, width as usize, height as usize))
        }
    }
}

// Drivers may pad the final buffer, so only a short buffer is an error.
fn check_len(name: &str, pixels: &[u8], expected: usize) -> Result<()> {
    if pixels.len() < expected {
        return Err(anyhow!(
            "{} frame too short: expected {} bytes, got {}",
            name,
            expected,
            pixels.len()
        ));
    }
    Ok(())
}

fn yuyv_to_rgb(pixels: &[u8], area: usize) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(area * 3);
    for chunk in pixels[..area * 2].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            rgb.extend_from_slice(&yuv_pixel(y as f32, u, v));
        }
    }
    rgb
}

fn nv12_to_rgb(pixels: &[u8], w: usize, h: usize) -> Vec<u8> {
    let y_plane = w * h;
    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;
            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&yuv_pixel(y, u, v));
        }
    }
    rgb
}

fn yuv_pixel(y: f32, u: f32, v: f32) -> [u8; 3] {
    [
        clamp_to_u8(y + 1.402 * v),
        clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v),
        clamp_to_u8(y + 1.772 * u),
    ]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
