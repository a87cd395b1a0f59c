//! rollcall-hw — Webcam capture for rollcall.
//!
//! Opens a V4L2 device, negotiates a pixel format, and hands frames to the
//! rest of the system as `image` buffers.

pub mod camera;
pub mod frame;

pub use camera::{CameraError, DeviceInfo, PixelFormat, Webcam};
pub use frame::Frame;
