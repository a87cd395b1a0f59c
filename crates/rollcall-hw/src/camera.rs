//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use image::DynamicImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Fraction of near-black pixels above which a frame is discarded.
const DARK_FRAME_THRESHOLD: f32 = 0.95;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("all {0} captured frames were too dark")]
    AllFramesDark(usize),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, the usual uncompressed webcam format.
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpg,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"MJPG" => Some(PixelFormat::Mjpg),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }
}

/// V4L2 webcam handle.
pub struct Webcam {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Webcam {
    /// Open a V4L2 device (e.g. "/dev/video0") at roughly `width`x`height`.
    ///
    /// YUYV is preferred, MJPG is the fallback for cameras that only stream
    /// compressed frames at the requested size. GREY is accepted if the
    /// driver insists on it.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        let device = connect(device_path)?;
        let (width, height, pixel_format) = negotiate(&device, width, height)?;
        tracing::info!(device = device_path, width, height, format = ?pixel_format, "camera ready");

        Ok(Self {
            device,
            width,
            height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Capture one usable frame.
    ///
    /// Discards `warmup` frames first so auto-exposure can settle, then takes
    /// up to `attempts` frames and returns the first that is not dark.
    pub fn capture(&self, warmup: usize, attempts: usize) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;

        for _ in 0..warmup {
            stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        }

        let attempts = attempts.max(1);
        for attempt in 0..attempts {
            let (buf, meta) = stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

            let used = match meta.bytesused as usize {
                0 => buf.len(),
                n => n.min(buf.len()),
            };
            let image = self.decode(&buf[..used])?;

            if frame::is_dark_frame(&image, DARK_FRAME_THRESHOLD) {
                tracing::debug!(seq = meta.sequence, "skipping dark frame");
                continue;
            }

            return Ok(Frame {
                image,
                sequence: meta.sequence,
                dark_skipped: attempt,
            });
        }

        Err(CameraError::AllFramesDark(attempts))
    }

    fn decode(&self, buf: &[u8]) -> Result<DynamicImage, FrameError> {
        Ok(match self.pixel_format {
            PixelFormat::Yuyv => DynamicImage::ImageRgb8(frame::yuyv_to_rgb(buf, self.width, self.height)?),
            PixelFormat::Grey => DynamicImage::ImageLuma8(frame::grey_to_image(buf, self.width, self.height)?),
            PixelFormat::Mjpg => frame::mjpg_to_image(buf)?,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let dev = Device::with_path(&path).ok()?;
                let caps = dev.query_caps().ok()?;
                if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

const EBUSY: i32 = 16;

fn connect(device_path: &str) -> Result<Device, CameraError> {
    if !Path::new(device_path).exists() {
        return Err(CameraError::DeviceNotFound(device_path.to_string()));
    }
    let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
        Some(EBUSY) => CameraError::DeviceBusy,
        _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
    })?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("query caps: {e}")))?;
    tracing::debug!(driver = %caps.driver, card = %caps.card, bus = %caps.bus, "device caps");
    if caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        Ok(device)
    } else {
        Err(CameraError::StreamingNotSupported)
    }
}

fn negotiate(device: &Device, width: u32, height: u32) -> Result<(u32, u32, PixelFormat), CameraError> {
    let current = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("read format: {e}")))?;

    let mut last = None;
    for wanted in [b"YUYV", b"MJPG"] {
        let mut fmt = current.clone();
        fmt.fourcc = FourCC::new(wanted);
        fmt.width = width;
        fmt.height = height;
        let got = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;
        match PixelFormat::from_fourcc(got.fourcc) {
            Some(pf) => return Ok((got.width, got.height, pf)),
            None => last = Some(got.fourcc),
        }
    }

    Err(CameraError::FormatNegotiationFailed(format!(
        "driver offered {:?}; YUYV, MJPG or GREY required",
        last
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"H264")), None);
    }

    #[test]
    fn test_open_missing_device() {
        let err = Webcam::open("/dev/does-not-exist", 640, 480).err().unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }
}
