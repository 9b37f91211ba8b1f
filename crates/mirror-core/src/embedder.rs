//! OpenFace-style face embedder via ONNX Runtime.
//!
//! Detects every face in the face window with SCRFD, aligns each one onto
//! the 96x96 landmark template, and embeds it with the nn4.small2 network
//! exported to ONNX, producing one 128-dimensional vector per face.

use crate::alignment::{align_face, ALIGNED_SIZE};
use crate::classifier::ClassifierError;
use crate::detector::FaceDetector;
use crate::pipeline::FaceEmbedder;
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const OPENFACE_EMBEDDING_DIM: usize = 128;
/// Mean brightness below which the window is skipped without running the detector.
const DEFAULT_PRESENCE_FLOOR: f32 = 20.0;

pub struct OnnxEmbedder {
    detector: FaceDetector,
    session: Session,
    presence_floor: f32,
}

impl OnnxEmbedder {
    /// Load the embedding network from the given path.
    pub fn load(model_path: &Path, detector: FaceDetector) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::InferenceFailed(format!(
                "embedding model not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            detector,
            session,
            presence_floor: DEFAULT_PRESENCE_FLOOR,
        })
    }

    pub fn with_presence_floor(mut self, floor: f32) -> Self {
        self.presence_floor = floor;
        self
    }

    fn embed_aligned(&mut self, face: &GrayImage) -> Result<Embedding, ClassifierError> {
        let input = face_tensor(face);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != OPENFACE_EMBEDDING_DIM {
            return Err(ClassifierError::InferenceFailed(format!(
                "expected {OPENFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(Embedding { values: raw.to_vec() }.normalized())
    }
}

fn gray_image(pixels: &[u8], width: u32, height: u32) -> Result<GrayImage, ClassifierError> {
    GrayImage::from_raw(width, height, pixels.to_vec()).ok_or_else(|| {
        ClassifierError::InvalidFrame(format!(
            "{} bytes do not form a {width}x{height} grayscale frame",
            pixels.len()
        ))
    })
}

/// Lay an aligned face out as a NCHW tensor in [0, 1], resizing if needed.
fn face_tensor(face: &GrayImage) -> Array4<f32> {
    let size = ALIGNED_SIZE;
    let resized;
    let face = if face.dimensions() == (size, size) {
        face
    } else {
        resized = imageops::resize(face, size, size, FilterType::Triangle);
        &resized
    };

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in face.enumerate_pixels() {
        let v = pixel.0[0] as f32 / 255.0;
        let (x, y) = (x as usize, y as usize);
        tensor[[0, 0, y, x]] = v;
        tensor[[0, 1, y, x]] = v;
        tensor[[0, 2, y, x]] = v;
    }
    tensor
}

/// Average pixel brightness (0.0–255.0).
fn mean_brightness(pixels: &[u8]) -> f32 {
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|&b| b as f32).sum::<f32>() / pixels.len() as f32
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Vec<Embedding>>, ClassifierError> {
        if width == 0 || height == 0 {
            return Ok(None);
        }
        let frame = gray_image(pixels, width, height)?;
        let brightness = mean_brightness(pixels);
        if brightness < self.presence_floor {
            tracing::trace!(brightness, "face window dark; skipping detection");
            return Ok(None);
        }

        let faces = self.detector.detect(&frame)?;
        let mut embeddings = Vec::with_capacity(faces.len());
        for face in &faces {
            let Some(aligned) = align_face(&frame, &face.landmarks) else {
                tracing::debug!(?face, "degenerate landmarks; face skipped");
                continue;
            };
            embeddings.push(self.embed_aligned(&aligned)?);
        }

        Ok((!embeddings.is_empty()).then_some(embeddings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_tensor_shape() {
        let face = GrayImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
        let tensor = face_tensor(&face);
        assert_eq!(tensor.shape(), &[1, 3, 96, 96]);
    }

    #[test]
    fn test_face_tensor_resizes_odd_input() {
        let face = GrayImage::from_pixel(200, 150, image::Luma([255]));
        let tensor = face_tensor(&face);
        assert_eq!(tensor.shape(), &[1, 3, 96, 96]);
        assert!(tensor.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_face_tensor_channels_identical() {
        let face = GrayImage::from_fn(96, 96, |x, y| image::Luma([((x * 7 + y * 3) % 251) as u8]));
        let tensor = face_tensor(&face);
        for y in 0..96 {
            for x in 0..96 {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
        assert!((tensor[[0, 0, 1, 2]] - 17.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_gray_image_rejects_short_buffer() {
        assert!(matches!(
            gray_image(&[0u8; 10], 96, 96),
            Err(ClassifierError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_mean_brightness() {
        assert_eq!(mean_brightness(&[]), 0.0);
        assert!((mean_brightness(&[0, 100, 200]) - 100.0).abs() < 1e-6);
    }
}
