//! rollcall-hw: V4L2 camera capture.
//!
//! Opens a capture device, negotiates YUYV/MJPG/GREY and hands out RGB
//! frames through the `FrameSource` trait from `rollcall-core`.

pub mod camera;
pub mod frame;

pub use camera::{
    list_devices, resolve_selector, Camera, CameraError, CaptureConfig, DeviceInfo, PixelFormat,
    V4l2Opener,
};
pub use frame::FrameError;
