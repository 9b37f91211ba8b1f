use serde::{Deserialize, Serialize};

/// Label assigned to faces the classifier is not confident about.
pub const UNKNOWN_LABEL: &str = "unknown";

/// Rendering of "nobody is tracked".
pub const NONE_LABEL: &str = "none";

/// One classification result for one detected face in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub label: String,
    /// Probability mass the classifier assigned to `label`, in [0, 1].
    pub confidence: f32,
}

impl Observation {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }

    /// True if the observation can be trusted structurally: a non-blank
    /// label and a finite confidence inside [0, 1].
    pub fn is_well_formed(&self) -> bool {
        !self.label.trim().is_empty()
            && self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
    }
}

/// Face embedding vector (128-dimensional for OpenFace nn4.small2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Return a copy scaled to unit L2 norm. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding { values }
    }

    /// Squared Euclidean distance between two embeddings.
    pub fn squared_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum()
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.squared_distance(other).sqrt()
    }
}

/// A detected face in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1].
    pub score: f32,
    /// Left eye, right eye, nose tip, left and right mouth corners.
    pub landmarks: [(f32, f32); 5],
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union; 0 when either box is empty.
    pub fn iou(&self, other: &FaceBox) -> f32 {
        let w = ((self.x + self.width).min(other.x + other.width) - self.x.max(other.x)).max(0.0);
        let h = ((self.y + self.height).min(other.y + other.height) - self.y.max(other.y)).max(0.0);
        let overlap = w * h;
        let union = self.area() + other.area() - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, size: f32) -> FaceBox {
        FaceBox {
            x,
            y,
            width: size,
            height: size,
            score: 0.9,
            landmarks: [(0.0, 0.0); 5],
        }
    }

    #[test]
    fn test_iou() {
        let a = face(0.0, 0.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&face(50.0, 50.0, 10.0)), 0.0);
        // 5x10 overlap over a 150 union
        let b = FaceBox { x: 5.0, ..a.clone() };
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(face(0.0, 0.0, 0.0).iou(&face(0.0, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn test_observation_well_formed() {
        assert!(Observation::new("alice", 0.9).is_well_formed());
        assert!(Observation::new("alice", 0.0).is_well_formed());
        assert!(Observation::new("alice", 1.0).is_well_formed());
    }

    #[test]
    fn test_observation_malformed() {
        assert!(!Observation::new("", 0.9).is_well_formed());
        assert!(!Observation::new("   ", 0.9).is_well_formed());
        assert!(!Observation::new("alice", f32::NAN).is_well_formed());
        assert!(!Observation::new("alice", 1.5).is_well_formed());
        assert!(!Observation::new("alice", -0.1).is_well_formed());
    }

    #[test]
    fn test_normalized_unit_length() {
        let e = Embedding { values: vec![3.0, 4.0] };
        let n = e.normalized();
        assert!((n.values[0] - 0.6).abs() < 1e-6);
        assert!((n.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_zero_vector() {
        let e = Embedding { values: vec![0.0, 0.0] };
        assert_eq!(e.normalized().values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding { values: vec![0.0, 0.0] };
        let b = Embedding { values: vec![3.0, 4.0] };
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert!((a.squared_distance(&b) - 25.0).abs() < 1e-6);
    }
}
