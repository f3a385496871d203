//! Raw V4L2 buffer → RGB conversion and dark-frame check.

use image::{ImageFormat, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short for {format}: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("MJPEG decode failed: {0}")]
    Decode(String),
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// BT.601 limited-range YCbCr → RGB, fixed point.
fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

/// Convert packed YUYV 4:2:2 to RGB.
///
/// Every 4 bytes `[Y0, U, Y1, V]` carry two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("YUYV", yuyv, pixels * 2)?;

    let mut out = Vec::with_capacity(pixels * 3);
    for quad in yuyv[..pixels * 2].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        out.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        out.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    // Odd pixel count leaves one trailing pixel without a full quad.
    if pixels % 2 == 1 {
        let tail = &yuyv[(pixels - 1) * 2..pixels * 2];
        out.extend_from_slice(&ycbcr_to_rgb(tail[0], tail[1], 128));
    }

    RgbImage::from_raw(width, height, out).ok_or(FrameError::InvalidLength {
        format: "YUYV",
        expected: pixels * 3,
        actual: 0,
    })
}

/// Replicate 8-bit grayscale into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", grey, pixels)?;
    let out: Vec<u8> = grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    RgbImage::from_raw(width, height, out).ok_or(FrameError::InvalidLength {
        format: "GREY",
        expected: pixels * 3,
        actual: 0,
    })
}

/// Decode one MJPEG frame.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<RgbImage, FrameError> {
    image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| FrameError::Decode(e.to_string()))
}

/// True when more than `threshold_pct` of pixels have luma below 32.
///
/// Cameras deliver black frames while exposure settles after stream start.
pub fn is_dark_frame(image: &RgbImage, threshold_pct: f32) -> bool {
    let total = (image.width() * image.height()) as usize;
    if total == 0 {
        return true;
    }
    let dark = image
        .pixels()
        .filter(|p| {
            let [r, g, b] = p.0;
            (77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8 < 32
        })
        .count();
    (dark as f32 / total as f32) > threshold_pct
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_yuyv_grey_levels() {
        // Neutral chroma: video black and video white
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_yuyv_chroma_shared_by_pair() {
        // Strong Cr: both pixels of the pair lean red
        let yuyv = vec![120, 128, 120, 220];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        for x in 0..2 {
            let [r, g, b] = rgb.get_pixel(x, 0).0;
            assert!(r > g && r > b, "pixel {x}: {:?}", (r, g, b));
        }
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let err = yuyv_to_rgb(&[100, 128], 2, 1).unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength { expected: 4, actual: 2, .. }));
    }

    #[test]
    fn test_grey_replicates_channels() {
        let rgb = grey_to_rgb(&[0, 77, 255, 9], 2, 2).unwrap();
        assert_eq!(rgb.get_pixel(1, 0), &Rgb([77, 77, 77]));
        assert_eq!(rgb.get_pixel(0, 1), &Rgb([255, 255, 255]));
        assert!(grey_to_rgb(&[1, 2, 3], 2, 2).is_err());
    }

    #[test]
    fn test_mjpeg_rejects_garbage() {
        assert!(matches!(mjpeg_to_rgb(&[0xff, 0xd8, 0x00]), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_dark_frame_detection() {
        assert!(is_dark_frame(&RgbImage::new(10, 10), 0.95));
        assert!(!is_dark_frame(&RgbImage::from_pixel(10, 10, Rgb([128, 128, 128])), 0.95));
        assert!(is_dark_frame(&RgbImage::new(0, 0), 0.95));

        // 94 dark, 6 bright of 100
        let mixed = RgbImage::from_fn(10, 10, |x, y| {
            if y * 10 + x < 94 {
                Rgb([5, 5, 5])
            } else {
                Rgb([200, 200, 200])
            }
        });
        assert!(!is_dark_frame(&mixed, 0.95));
    }
}
