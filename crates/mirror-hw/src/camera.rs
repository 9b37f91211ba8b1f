//! V4L2 webcam capture via the `v4l` crate.

use crate::frame::{self, Frame};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Buffers queued in the capture stream.
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("device already released")]
    Released,
}

/// A source of frames the capture loop can pull from.
pub trait CaptureDevice {
    /// Block until the next frame is available.
    fn read(&mut self) -> Result<Frame, CameraError>;

    /// Resolution the device currently delivers, as (width, height).
    fn resolution(&self) -> (u32, u32);

    /// Give the device back to the system. Further reads fail.
    fn release(&mut self);
}

/// Which camera to open: a `/dev/videoN` index or an explicit device path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VideoDevice {
    Index(u32),
    Path(String),
}

impl VideoDevice {
    pub fn path(&self) -> String {
        match self {
            VideoDevice::Index(i) => format!("/dev/video{i}"),
            VideoDevice::Path(p) => p.clone(),
        }
    }
}

impl Default for VideoDevice {
    fn default() -> Self {
        VideoDevice::Index(0)
    }
}

impl fmt::Display for VideoDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl std::str::FromStr for VideoDevice {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<u32>() {
            Ok(i) => VideoDevice::Index(i),
            Err(_) => VideoDevice::Path(s.to_string()),
        })
    }
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
enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
}

/// V4L2 camera device handle.
///
/// The mmap stream is started on the first read and kept running until
/// [`CaptureDevice::release`], so consecutive reads dequeue live buffers.
pub struct Camera {
    // Declared before `device`: the stream is torn down first.
    stream: Option<MmapStream<'static>>,
    device: Option<Device>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a camera, optionally asking the driver for a specific resolution.
    pub fn open(video: &VideoDevice, resolution: Option<(u32, u32)>) -> Result<Self, CameraError> {
        let device_path = video.path();
        if !Path::new(&device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path));
        }

        let device = Device::with_path(&device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = %device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        if let Some((width, height)) = resolution {
            fmt.width = width;
            fmt.height = height;
        }

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV or GREY)"
            )));
        };

        if let Some((width, height)) = resolution {
            if (negotiated.width, negotiated.height) != (width, height) {
                tracing::warn!(
                    requested_width = width,
                    requested_height = height,
                    width = negotiated.width,
                    height = negotiated.height,
                    "driver adjusted requested resolution"
                );
            }
        }

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            stream: None,
            device: Some(device),
            width: negotiated.width,
            height: negotiated.height,
            device_path,
            fourcc,
            pixel_format,
        })
    }

    /// The running capture stream, started on first use.
    fn stream(&mut self) -> Result<&mut MmapStream<'static>, CameraError> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let device = self.device.as_ref().ok_or(CameraError::Released)?;
                let stream = MmapStream::with_buffers(device, BufType::VideoCapture, STREAM_BUFFERS)
                    .map_err(|e| {
                        CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
                    })?;
                tracing::debug!(device = %self.device_path, buffers = STREAM_BUFFERS, "capture stream started");
                stream
            }
        };
        Ok(self.stream.insert(stream))
    }

    /// Dequeue the next frame from the running stream, converting to grayscale.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (width, height, format) = (self.width, self.height, self.pixel_format);
        let dequeued = self
            .stream()?
            .next()
            .map(|(buf, meta)| (to_grayscale(format, width, height, buf), meta.sequence));

        let (gray, sequence) = match dequeued {
            Ok(frame) => frame,
            Err(e) => {
                // Restart the stream on the next read.
                self.stream = None;
                return Err(CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")));
            }
        };

        Frame::new(gray?, width, height, sequence).map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
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
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl CaptureDevice for Camera {
    fn read(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn release(&mut self) {
        self.stream = None;
        if self.device.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }
}

/// Convert a raw buffer to grayscale based on the negotiated format.
fn to_grayscale(format: PixelFormat, width: u32, height: u32, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
    let pixels = (width * height) as usize;

    match format {
        PixelFormat::Grey => {
            if buf.len() < pixels {
                return Err(CameraError::CaptureFailed(format!(
                    "GREY buffer too short: expected {pixels}, got {}",
                    buf.len()
                )));
            }
            Ok(buf[..pixels].to_vec())
        }
        PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_device_from_index() {
        let dev: VideoDevice = "2".parse().unwrap();
        assert_eq!(dev, VideoDevice::Index(2));
        assert_eq!(dev.path(), "/dev/video2");
    }

    #[test]
    fn test_video_device_from_path() {
        let dev: VideoDevice = "/dev/v4l/by-id/usb-cam".parse().unwrap();
        assert_eq!(dev.path(), "/dev/v4l/by-id/usb-cam");
    }

    #[test]
    fn test_video_device_deserialize_untagged() {
        let idx: VideoDevice = serde_json::from_str("1").unwrap();
        assert_eq!(idx, VideoDevice::Index(1));
        let path: VideoDevice = serde_json::from_str("\"/dev/video7\"").unwrap();
        assert_eq!(path, VideoDevice::Path("/dev/video7".into()));
    }

    fn released_camera() -> Camera {
        Camera {
            stream: None,
            device: None,
            width: 4,
            height: 2,
            device_path: "/dev/video9".into(),
            fourcc: FourCC::new(b"GREY"),
            pixel_format: PixelFormat::Grey,
        }
    }

    #[test]
    fn test_released_camera_stops_reading() {
        let mut camera = released_camera();
        assert!(matches!(camera.read(), Err(CameraError::Released)));
        assert!(camera.stream.is_none());
        camera.release();
        camera.release();
        assert!(matches!(camera.read(), Err(CameraError::Released)));
        assert_eq!(camera.resolution(), (4, 2));
    }

    #[test]
    fn test_grey_buffer_is_trimmed_to_frame() {
        let gray = to_grayscale(PixelFormat::Grey, 4, 2, &[7u8; 12]).unwrap();
        assert_eq!(gray, vec![7u8; 8]);
        assert!(to_grayscale(PixelFormat::Grey, 4, 2, &[7u8; 5]).is_err());
    }

    #[test]
    fn test_yuyv_buffer_keeps_luma() {
        // Y U Y V pairs: luma 10, 20, 30, 40
        let buf = [10, 128, 20, 128, 30, 128, 40, 128];
        assert_eq!(to_grayscale(PixelFormat::Yuyv, 2, 2, &buf).unwrap(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open(&VideoDevice::Path("/dev/does-not-exist".into()), None)
            .err()
            .unwrap();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
    }
}
