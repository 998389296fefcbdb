use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Yuyv,
    Nv12,
    Mjpeg,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            b"NV12" => Some(Self::Nv12),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<RgbImage> {
    match format {
        PixelFormat::Rgb24 => {
            let expected = width
                .checked_mul(height)
                .and_then(|v| v.checked_mul(3))
                .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))? as usize;
            if pixels.len() < expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            RgbImage::from_raw(width, height, pixels[..expected].to_vec())
                .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height))
        }
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height),
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height),
        PixelFormat::Mjpeg => {
            let image = image::load_from_memory_with_format(pixels, ImageFormat::Jpeg)
                .context("decode MJPG frame")?
                .to_rgb8();
            if image.dimensions() != (width, height) {
                return Err(anyhow!(
                    "MJPG frame is {}x{}, expected {}x{}",
                    image.width(),
                    image.height(),
                    width,
                    height
                ));
            }
            Ok(image)
        }
    }
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let w = width as usize;
    let h = height as usize;
    let expected = w
        .checked_mul(h)
        .and_then(|v| v.checked_mul(2))
        .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
    if pixels.len() < expected || w % 2 != 0 {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = Vec::with_capacity(w * h * 3);
    for chunk in pixels[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            rgb.extend_from_slice(&yuv_to_rgb(y as f32, u, v));
        }
    }
    RgbImage::from_raw(width, height, rgb).ok_or_else(|| anyhow!("YUYV conversion size mismatch"))
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = y_plane
        .checked_add(y_plane / 2)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    if pixels.len() < expected {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or_else(|| anyhow!("NV12 conversion size mismatch"))
}

fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [u8; 3] {
    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;
    [clamp_to_u8(r), clamp_to_u8(g), clamp_to_u8(b)]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_conversion_produces_gray() -> Result<()> {
        let y_plane = vec![128u8; 4];
        let uv_plane = vec![128u8; 2];
        let nv12 = [y_plane, uv_plane].concat();

        let rgb = normalize_to_rgb(&nv12, 2, 2, PixelFormat::Nv12)?;
        assert_eq!(rgb.as_raw(), &vec![128u8; 12]);

        Ok(())
    }

    #[test]
    fn yuyv_conversion_produces_gray() -> Result<()> {
        let yuyv = vec![128u8; 8];
        let rgb = normalize_to_rgb(&yuyv, 2, 2, PixelFormat::Yuyv)?;
        assert_eq!(rgb.as_raw(), &vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn rgb_pass_through_validates_length() -> Result<()> {
        let pixels = vec![1u8; 9];
        let rgb = normalize_to_rgb(&pixels, 1, 3, PixelFormat::Rgb24)?;
        assert_eq!(rgb.as_raw(), &pixels);
        assert!(normalize_to_rgb(&pixels, 2, 3, PixelFormat::Rgb24).is_err());
        Ok(())
    }

    #[test]
    fn fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(b"YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(b"H264"), None);
    }
}
