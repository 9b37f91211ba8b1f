//! SCRFD face detector via ONNX Runtime.
//!
//! Finds every face in the face window together with its five landmarks.
//! The frame is letterboxed into the 640x640 network input, the three
//! stride heads are decoded anchor by anchor, and overlapping boxes are
//! merged with greedy NMS.

use crate::classifier::ClassifierError;
use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Output positions of one stride's (score, bbox, landmark) tensors.
type Heads = (usize, usize, usize);

/// Scale and padding that fit a frame into the square network input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let side = INPUT_SIZE as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let (w, h) = scaled_size(width, height, scale);
        Self {
            scale,
            pad_x: (INPUT_SIZE - w) / 2,
            pad_y: (INPUT_SIZE - h) / 2,
        }
    }

    /// Network input coordinates back to frame coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

fn scaled_size(width: u32, height: u32, scale: f32) -> (u32, u32) {
    let w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    (w, h)
}

pub struct FaceDetector {
    session: Session,
    heads: [Heads; 3],
}

impl FaceDetector {
    /// Load the SCRFD network (e.g. `det_10g.onnx`) from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::InferenceFailed(format!(
                "detector model not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(ClassifierError::InferenceFailed(format!(
                "detector needs score, bbox and landmark outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let heads = output_heads(&names);

        tracing::info!(
            path = %model_path.display(),
            outputs = ?names,
            ?heads,
            "loaded face detector"
        );

        Ok(Self { session, heads })
    }

    /// All faces in `frame`, best score first. Empty when nobody is there.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<FaceBox>, ClassifierError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(frame);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in STRIDES.iter().zip(&self.heads) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ClassifierError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ClassifierError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let (_, landmarks) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ClassifierError::InferenceFailed(format!("landmarks stride {stride}: {e}")))?;

            let level = StrideOutput {
                stride,
                scores,
                boxes,
                landmarks,
            };
            candidates.extend(decode_stride(&level, &letterbox, SCORE_THRESHOLD));
        }

        let faces = suppress_overlaps(candidates, NMS_IOU);
        tracing::trace!(faces = faces.len(), "faces detected");
        Ok(faces)
    }
}

/// Letterbox a grayscale frame into a normalized NCHW tensor.
///
/// The tensor starts at zero, which is what padding at the pixel mean
/// normalizes to.
fn preprocess(frame: &GrayImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(frame.width(), frame.height());
    let (w, h) = scaled_size(frame.width(), frame.height(), letterbox.scale);
    let resized = imageops::resize(frame, w, h, FilterType::Triangle);

    let side = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let v = (pixel.0[0] as f32 - PIXEL_MEAN) / PIXEL_STD;
        let x = (x + letterbox.pad_x) as usize;
        let y = (y + letterbox.pad_y) as usize;
        for c in 0..3 {
            tensor[[0, c, y, x]] = v;
        }
    }
    (tensor, letterbox)
}

/// Find each stride's outputs by name (`score_8`, `bbox_16`, `kps_32`, ...).
/// Exports with generic names use the usual order: three score tensors,
/// then three box tensors, then three landmark tensors.
fn output_heads(names: &[String]) -> [Heads; 3] {
    let position = |kind: &str, stride: u32| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let named: Option<Vec<Heads>> = STRIDES
        .iter()
        .map(|&s| Some((position("score", s)?, position("bbox", s)?, position("kps", s)?)))
        .collect();

    match named.and_then(|heads| <[Heads; 3]>::try_from(heads).ok()) {
        Some(heads) => heads,
        None => {
            tracing::debug!("detector outputs not named by stride; using positional order");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Raw head outputs of one stride.
struct StrideOutput<'a> {
    stride: u32,
    scores: &'a [f32],
    boxes: &'a [f32],
    landmarks: &'a [f32],
}

/// Turn every anchor scoring above `threshold` into a face in frame space.
fn decode_stride(level: &StrideOutput<'_>, letterbox: &Letterbox, threshold: f32) -> Vec<FaceBox> {
    let cells = (INPUT_SIZE / level.stride) as usize;
    let step = level.stride as f32;
    let anchors = cells * cells * ANCHORS_PER_CELL;

    let mut faces = Vec::new();
    for (idx, &score) in level.scores.iter().enumerate().take(anchors) {
        if score <= threshold {
            continue;
        }
        let (Some(b), Some(k)) = (
            level.boxes.get(idx * 4..idx * 4 + 4),
            level.landmarks.get(idx * 10..idx * 10 + 10),
        ) else {
            continue;
        };

        let cell = idx / ANCHORS_PER_CELL;
        let ax = (cell % cells) as f32 * step;
        let ay = (cell / cells) as f32 * step;

        let (x0, y0) = letterbox.unmap(ax - b[0] * step, ay - b[1] * step);
        let (x1, y1) = letterbox.unmap(ax + b[2] * step, ay + b[3] * step);
        let landmarks =
            std::array::from_fn(|i| letterbox.unmap(ax + k[2 * i] * step, ay + k[2 * i + 1] * step));

        faces.push(FaceBox {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
            score,
            landmarks,
        });
    }
    faces
}

/// Greedy non-maximum suppression; survivors come out best score first.
fn suppress_overlaps(mut candidates: Vec<FaceBox>, max_iou: f32) -> Vec<FaceBox> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<FaceBox> = Vec::new();
    for face in candidates {
        if kept.iter().all(|k| k.iou(&face) <= max_iou) {
            kept.push(face);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, size: f32, score: f32) -> FaceBox {
        FaceBox {
            x,
            y,
            width: size,
            height: size,
            score,
            landmarks: [(0.0, 0.0); 5],
        }
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        let lb = Letterbox::fit(320, 240);
        assert_eq!(lb, Letterbox { scale: 2.0, pad_x: 0, pad_y: 80 });
        let (x, y) = lb.unmap(100.0 * 2.0, 50.0 * 2.0 + 80.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = GrayImage::from_pixel(320, 240, image::Luma([255]));
        let (tensor, lb) = preprocess(&frame);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        // padding rows above the image
        assert_eq!(tensor[[0, 0, 10, 320]], 0.0);
        // image content
        let inside = tensor[[0, 2, lb.pad_y as usize + 10, 320]];
        assert!((inside - (255.0 - PIXEL_MEAN) / PIXEL_STD).abs() < 1e-3);
    }

    #[test]
    fn test_output_heads_by_name() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(output_heads(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_output_heads_positional() {
        let names: Vec<String> = (440..449).map(|i: u32| i.to_string()).collect();
        assert_eq!(output_heads(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_decode_stride_places_anchor() {
        // stride 32: 20x20 cells, 2 anchors each; anchor 42 sits in cell (1, 1)
        let mut scores = vec![0.0f32; 800];
        scores[42] = 0.9;
        scores[7] = 0.5; // at threshold, dropped
        let boxes = vec![1.0f32; 800 * 4];
        let landmarks = vec![0.0f32; 800 * 10];
        let level = StrideOutput {
            stride: 32,
            scores: &scores,
            boxes: &boxes,
            landmarks: &landmarks,
        };
        let identity = Letterbox { scale: 1.0, pad_x: 0, pad_y: 0 };

        let faces = decode_stride(&level, &identity, SCORE_THRESHOLD);
        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert_eq!((f.x, f.y, f.width, f.height), (0.0, 0.0, 64.0, 64.0));
        assert_eq!(f.landmarks, [(32.0, 32.0); 5]);
    }

    #[test]
    fn test_decode_stride_skips_truncated_outputs() {
        let scores = vec![0.9f32; 4];
        let level = StrideOutput {
            stride: 32,
            scores: &scores,
            boxes: &[1.0; 8],
            landmarks: &[0.0; 40],
        };
        let identity = Letterbox { scale: 1.0, pad_x: 0, pad_y: 0 };
        assert_eq!(decode_stride(&level, &identity, 0.5).len(), 2);
    }

    #[test]
    fn test_suppress_overlaps_keeps_distinct_faces() {
        let faces = suppress_overlaps(
            vec![
                face(5.0, 5.0, 100.0, 0.8),
                face(300.0, 40.0, 80.0, 0.7),
                face(0.0, 0.0, 100.0, 0.9),
            ],
            NMS_IOU,
        );
        let scores: Vec<f32> = faces.iter().map(|f| f.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_suppress_overlaps_empty() {
        assert!(suppress_overlaps(Vec::new(), NMS_IOU).is_empty());
    }

    #[test]
    fn test_load_missing_model() {
        assert!(FaceDetector::load(Path::new("/nonexistent/det_10g.onnx")).is_err());
    }
}
