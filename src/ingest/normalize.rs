use anyhow::{anyhow, Context, Result};

use crate::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Yuyv,
    Mjpeg,
}

impl PixelFormat {
    #[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" | b"JPEG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

/// Convert one captured buffer into an RGB frame.
pub(crate) fn normalize_to_frame(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Frame> {
    let rgb = match format {
        PixelFormat::Rgb24 => {
            let expected = frame_len(width, height, 3)?;
            if pixels.len() < expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            pixels[..expected].to_vec()
        }
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height)?,
        PixelFormat::Mjpeg => {
            let decoded = image::load_from_memory_with_format(pixels, image::ImageFormat::Jpeg)
                .context("decode MJPEG frame")?;
            return Ok(Frame::new(decoded.to_rgb8()));
        }
    };
    Frame::from_rgb(width, height, rgb).ok_or_else(|| anyhow!("frame buffer size mismatch"))
}

fn frame_len(width: u32, height: u32, bytes_per_pixel: usize) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(bytes_per_pixel))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected = frame_len(width, height, 2)?;
    if width % 2 != 0 {
        return Err(anyhow!("YUYV frame width must be even, got {}", width));
    }
    if pixels.len() < expected {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = Vec::with_capacity(frame_len(width, height, 3)?);
    for chunk in pixels[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rgb_passthrough_keeps_pixels() {
        let pixels = vec![1, 2, 3, 4, 5, 6];
        let frame = normalize_to_frame(&pixels, 2, 1, PixelFormat::Rgb24).unwrap();
        assert_eq!(frame.pixel(0, 0), [1, 2, 3]);
        assert_eq!(frame.pixel(1, 0), [4, 5, 6]);
    }

    #[test]
    fn rgb_rejects_short_buffer() {
        assert!(normalize_to_frame(&[0; 5], 2, 1, PixelFormat::Rgb24).is_err());
    }

    #[test]
    fn yuyv_grey_maps_to_grey() {
        // Neutral chroma: R = G = B = Y.
        let pixels = vec![100, 128, 200, 128];
        let frame = normalize_to_frame(&pixels, 2, 1, PixelFormat::Yuyv).unwrap();
        assert_eq!(frame.pixel(0, 0), [100, 100, 100]);
        assert_eq!(frame.pixel(1, 0), [200, 200, 200]);
    }

    #[test]
    fn mjpeg_decodes_to_rgb() {
        let src = image::RgbImage::from_pixel(8, 8, image::Rgb([200, 200, 200]));
        let mut jpeg = Cursor::new(Vec::new());
        src.write_to(&mut jpeg, image::ImageFormat::Jpeg).unwrap();

        let frame = normalize_to_frame(jpeg.get_ref(), 8, 8, PixelFormat::Mjpeg).unwrap();
        assert_eq!(frame.width(), 8);
        assert_eq!(frame.height(), 8);
    }

    #[test]
    fn fourcc_lookup() {
        assert_eq!(PixelFormat::from_fourcc(b"YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(b"NV12"), None);
    }
}
