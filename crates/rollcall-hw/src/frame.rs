//! Frame type, YUYV/GREY/MJPG conversion to `image` buffers, and dark-frame detection.

use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};

/// A captured camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: DynamicImage,
    /// Driver sequence number.
    pub sequence: u32,
    /// Dark frames discarded before this one.
    pub dark_skipped: usize,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected || width % 2 != 0 {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut img = RgbImage::new(width, height);
    for (i, chunk) in yuyv[..expected].chunks_exact(4).enumerate() {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        let px = (i * 2) as u32;
        let (x, y) = (px % width, px / width);
        img.put_pixel(x, y, ycbcr_to_rgb(y0, u, v));
        img.put_pixel(x + 1, y, ycbcr_to_rgb(y1, u, v));
    }
    Ok(img)
}

fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> Rgb<u8> {
    let c = (y as f32 - 16.0) * 1.164;
    let d = cb as f32 - 128.0;
    let e = cr as f32 - 128.0;
    let clamp = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    Rgb([
        clamp(c + 1.596 * e),
        clamp(c - 0.392 * d - 0.813 * e),
        clamp(c + 2.017 * d),
    ])
}

/// Wrap an 8-bit grayscale buffer.
pub fn grey_to_image(grey: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let expected = (width * height) as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: grey.len(),
        });
    }
    GrayImage::from_raw(width, height, grey[..expected].to_vec()).ok_or(FrameError::InvalidLength {
        expected,
        actual: grey.len(),
    })
}

/// Decode a Motion-JPEG frame.
pub fn mjpg_to_image(jpeg: &[u8]) -> Result<DynamicImage, FrameError> {
    Ok(image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)?)
}

/// Check if a frame is dark: more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(image: &DynamicImage, threshold_pct: f32) -> bool {
    let luma = image.to_luma8();
    let total = luma.pixels().len();
    if total == 0 {
        return true;
    }
    let dark = luma.pixels().filter(|Luma([p])| *p < 32).count();
    (dark as f32 / total as f32) > threshold_pct
}
