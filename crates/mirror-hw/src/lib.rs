//! mirror-hw — Hardware abstraction for the mirror's webcam.
//!
//! Provides V4L2-based frame capture behind the [`CaptureDevice`] trait,
//! plus grayscale frame handling and region-of-interest cropping.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CaptureDevice, DeviceInfo, VideoDevice};
pub use frame::{Frame, FrameError, PixelRect, Roi};
