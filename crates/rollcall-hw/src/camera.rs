//! V4L2 camera capture via the `v4l` crate, exposed as a frame source.

use crate::frame::{self, FrameError};
use image::RgbImage;
use rollcall_core::frame::Frame;
use rollcall_core::source::{FrameSource, FrameSourceOpener, SourceError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;
const DARK_THRESHOLD: f32 = 0.95;
/// Highest `/dev/videoN` index scanned by [`list_devices`].
const MAX_DEVICE_INDEX: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("{0} is not a video capture device")]
    NotCapture(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("camera released")]
    Released,
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

/// Negotiated pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, 2 bytes/pixel.
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpeg,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

/// Capture parameters requested from the driver.
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    /// Frames discarded after the stream starts while exposure settles.
    pub warmup_frames: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            warmup_frames: 4,
        }
    }
}

/// Map a selector to a device path. Bare indices (`"0"`) mean `/dev/videoN`.
pub fn resolve_selector(selector: &str) -> String {
    let trimmed = selector.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        format!("/dev/video{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// An open V4L2 camera. The mmap stream is created on first read.
pub struct Camera {
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
    warmup_frames: u32,
}

impl Camera {
    /// Open `device_path` and negotiate the requested size, preferring YUYV.
    pub fn open(device_path: &str, config: CaptureConfig) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCapture(device_path.to_string()));
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = config.width;
        fmt.height = config.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {} (need YUYV, MJPG or GREY)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "opened camera"
        );

        Ok(Self {
            device: Some(device),
            stream: None,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
            warmup_frames: config.warmup_frames,
        })
    }

    fn stream(&mut self) -> Result<&mut MmapStream<'static>, CameraError> {
        if self.stream.is_none() {
            let device = self.device.as_ref().ok_or(CameraError::Released)?;
            let mut stream =
                MmapStream::with_buffers(device, BufType::VideoCapture, STREAM_BUFFERS).map_err(
                    |e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")),
                )?;

            for _ in 0..self.warmup_frames {
                if let Err(e) = stream.next() {
                    tracing::debug!(error = %e, "warmup frame dropped");
                }
            }
            self.stream = Some(stream);
        }
        self.stream.as_mut().ok_or(CameraError::Released)
    }

    /// Dequeue one buffer and convert it to RGB.
    pub fn capture(&mut self) -> Result<Frame, CameraError> {
        let (width, height, format) = (self.width, self.height, self.pixel_format);
        let stream = self.stream()?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let image = to_rgb(format, buf, width, height)?;
        if frame::is_dark_frame(&image, DARK_THRESHOLD) {
            tracing::trace!(seq = meta.sequence, "dark frame");
        }
        Ok(Frame::new(image, meta.sequence as u64))
    }

    /// Stop streaming and close the device.
    pub fn close(&mut self) {
        self.stream = None;
        if self.device.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }
}

fn to_rgb(
    format: PixelFormat,
    buf: &[u8],
    width: u32,
    height: u32,
) -> Result<RgbImage, FrameError> {
    match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
        PixelFormat::Grey => frame::grey_to_rgb(buf, width, height),
        PixelFormat::Mjpeg => frame::mjpeg_to_rgb(buf),
    }
}

impl FrameSource for Camera {
    fn read(&mut self) -> Result<Frame, SourceError> {
        self.capture().map_err(|e| SourceError::Read(e.to_string()))
    }

    fn release(&mut self) {
        self.close();
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens [`Camera`]s with a fixed capture configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Opener {
    pub config: CaptureConfig,
}

impl V4l2Opener {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

impl FrameSourceOpener for V4l2Opener {
    fn open(&self, selector: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        let path = resolve_selector(selector);
        let camera = Camera::open(&path, self.config).map_err(|e| SourceError::Open {
            selector: selector.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(camera))
    }
}

/// List V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for i in 0..MAX_DEVICE_INDEX {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            continue;
        }
        devices.push(DeviceInfo {
            path,
            name: caps.card,
            driver: caps.driver,
            bus: caps.bus,
        });
    }

    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_selector() {
        assert_eq!(resolve_selector("0"), "/dev/video0");
        assert_eq!(resolve_selector(" 12 "), "/dev/video12");
        assert_eq!(resolve_selector("/dev/video2"), "/dev/video2");
        assert_eq!(resolve_selector(""), "");
    }

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), None);
    }

    #[test]
    fn test_missing_device_fails_open() {
        let opener = V4l2Opener::default();
        match opener.open("/dev/rollcall-no-such-camera") {
            Err(SourceError::Open { selector, reason }) => {
                assert_eq!(selector, "/dev/rollcall-no-such-camera");
                assert!(reason.contains("not found"), "{reason}");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("opened a nonexistent camera"),
        }
    }

    #[test]
    fn test_grey_buffer_conversion() {
        let image = to_rgb(PixelFormat::Grey, &[10, 20, 30, 40], 2, 2).unwrap();
        assert_eq!(image.get_pixel(1, 1).0, [40, 40, 40]);
    }
}
