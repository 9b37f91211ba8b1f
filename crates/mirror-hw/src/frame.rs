//! Frame type, YUYV conversion and region-of-interest cropping.

use image::{imageops, GrayImage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid region of interest {0:?}: need 0 <= x0 < x1 <= 1 and 0 <= y0 < y1 <= 1")]
    InvalidRoi([f32; 4]),
}

/// A captured grayscale camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// When the frame was dequeued; carried through crops.
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = (width * height) as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// Copy out the pixels inside `rect`, clamped to the frame.
    pub fn crop(&self, rect: PixelRect) -> Result<Frame, FrameError> {
        let x0 = rect.x0.min(self.width);
        let y0 = rect.y0.min(self.height);
        let w = rect.x1.min(self.width).saturating_sub(x0);
        let h = rect.y1.min(self.height).saturating_sub(y0);

        let image = GrayImage::from_raw(self.width, self.height, self.data.clone()).ok_or(
            FrameError::InvalidLength {
                expected: (self.width * self.height) as usize,
                actual: self.data.len(),
            },
        )?;
        let cropped = imageops::crop_imm(&image, x0, y0, w, h).to_image();

        Ok(Frame {
            data: cropped.into_raw(),
            width: w,
            height: h,
            timestamp: self.timestamp,
            sequence: self.sequence,
        })
    }

    /// Crop to `roi` if one is configured, converting it against this frame's size.
    pub fn crop_to(&self, roi: Option<&Roi>) -> Result<Frame, FrameError> {
        match roi {
            Some(roi) => self.crop(roi.to_pixels(self.width, self.height)),
            None => Ok(self.clone()),
        }
    }
}

/// Region of interest in fractions of frame width and height.
///
/// `[0.25, 0.25, 0.75, 0.75]` on a 640x480 frame selects x 160..480, y 120..360.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f32; 4]", into = "[f32; 4]")]
pub struct Roi {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Roi {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Result<Self, FrameError> {
        let unit = |v: f32| v.is_finite() && (0.0..=1.0).contains(&v);
        if !(unit(x0) && unit(y0) && unit(x1) && unit(y1) && x0 < x1 && y0 < y1) {
            return Err(FrameError::InvalidRoi([x0, y0, x1, y1]));
        }
        Ok(Self { x0, y0, x1, y1 })
    }

    /// Absolute pixel bounds for a frame of the given size.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelRect {
        let scale = |f: f32, extent: u32| ((f * extent as f32).floor() as u32).min(extent);
        PixelRect {
            x0: scale(self.x0, width),
            y0: scale(self.y0, height),
            x1: scale(self.x1, width),
            y1: scale(self.y1, height),
        }
    }
}

impl TryFrom<[f32; 4]> for Roi {
    type Error = FrameError;

    fn try_from(v: [f32; 4]) -> Result<Self, Self::Error> {
        Roi::new(v[0], v[1], v[2], v[3])
    }
}

impl From<Roi> for [f32; 4] {
    fn from(roi: Roi) -> Self {
        [roi.x0, roi.y0, roi.x1, roi.y1]
    }
}

/// Absolute crop bounds; `x1`/`y1` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}
