//! Contract for the per-frame face classifier.

use crate::types::Observation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Distance of one classified face from the centre of its winning class.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub label: String,
    pub distance_from_mean: f32,
}

/// Face classifier fed with grayscale frames.
pub trait Classifier {
    /// Classify every face in the frame.
    ///
    /// `Ok(None)` means no face was found; `Ok(Some(vec))` carries one
    /// observation per face. `Err` is reserved for classifier failures.
    fn infer(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Vec<Observation>>, ClassifierError>;

    /// Per-face diagnostics of the last `infer` call, if the classifier has any.
    fn diagnostics(&self) -> &[Diagnostic] {
        &[]
    }
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn infer(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Vec<Observation>>, ClassifierError> {
        (**self).infer(pixels, width, height)
    }

    fn diagnostics(&self) -> &[Diagnostic] {
        (**self).diagnostics()
    }
}

/// Map observations to the labels handed to the smoother.
///
/// Anything at or below `threshold` becomes `unknown_label`, so a
/// low-confidence guess can never become the tracked identity.
pub fn apply_threshold(
    observations: &[Observation],
    threshold: f32,
    unknown_label: &str,
) -> Vec<String> {
    observations
        .iter()
        .map(|o| {
            if o.confidence <= threshold {
                unknown_label.to_string()
            } else {
                o.label.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UNKNOWN_LABEL;

    #[test]
    fn test_threshold_boundary_maps_to_unknown() {
        let obs = vec![
            Observation::new("alice", 0.5),
            Observation::new("bob", 0.500_001),
            Observation::new("carol", 0.1),
        ];
        let labels = apply_threshold(&obs, 0.5, UNKNOWN_LABEL);
        assert_eq!(labels, vec!["unknown", "bob", "unknown"]);
    }

    #[test]
    fn test_threshold_sweep() {
        let threshold = 0.5;
        for i in 0..=100 {
            let c = i as f32 / 100.0;
            let labels = apply_threshold(&[Observation::new("alice", c)], threshold, UNKNOWN_LABEL);
            if c <= threshold {
                assert_eq!(labels[0], "unknown", "confidence {c}");
            } else {
                assert_eq!(labels[0], "alice", "confidence {c}");
            }
        }
    }

    #[test]
    fn test_custom_unknown_label() {
        let labels = apply_threshold(&[Observation::new("alice", 0.2)], 0.5, "stranger");
        assert_eq!(labels, vec!["stranger"]);
    }

    #[test]
    fn test_empty_batch() {
        assert!(apply_threshold(&[], 0.5, UNKNOWN_LABEL).is_empty());
    }

    struct Fixed;

    impl Classifier for Fixed {
        fn infer(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Option<Vec<Observation>>, ClassifierError> {
            Ok(Some(vec![Observation::new("alice", 0.9)]))
        }
    }

    #[test]
    fn test_boxed_classifier_delegates() {
        let mut boxed: Box<dyn Classifier> = Box::new(Fixed);
        let out = boxed.infer(&[], 0, 0).unwrap().unwrap();
        assert_eq!(out[0].label, "alice");
        assert!(boxed.diagnostics().is_empty());
    }
}
