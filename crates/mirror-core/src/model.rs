//! Persisted identity classifier: label encoder plus per-class centroids.
//!
//! Fitted offline by `mirror train` and loaded once when the daemon starts.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const DEFAULT_TEMPERATURE: f32 = 0.1;
const ARTIFACT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("classifier file not found: {0}; run `mirror train` first")]
    NotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no training samples")]
    Empty,
    #[error("{embeddings} embeddings but {labels} labels")]
    LengthMismatch { embeddings: usize, labels: usize },
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("unsupported classifier version {0}")]
    UnsupportedVersion(u32),
    #[error("temperature must be positive, got {0}")]
    InvalidTemperature(f32),
}

/// Winning class for one embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
    /// Euclidean distance from the winning class centroid.
    pub distance: f32,
}

/// Nearest-centroid classifier with softmax confidences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierModel {
    version: u32,
    /// Label encoder: class index → class name, sorted.
    classes: Vec<String>,
    /// One unit-length centroid per class, same order as `classes`.
    centroids: Vec<Vec<f32>>,
    temperature: f32,
}

impl ClassifierModel {
    /// Fit one centroid per distinct label.
    pub fn fit(embeddings: &[Embedding], labels: &[String]) -> Result<Self, ModelError> {
        Self::fit_with_temperature(embeddings, labels, DEFAULT_TEMPERATURE)
    }

    pub fn fit_with_temperature(
        embeddings: &[Embedding],
        labels: &[String],
        temperature: f32,
    ) -> Result<Self, ModelError> {
        if embeddings.len() != labels.len() {
            return Err(ModelError::LengthMismatch {
                embeddings: embeddings.len(),
                labels: labels.len(),
            });
        }
        if embeddings.is_empty() {
            return Err(ModelError::Empty);
        }
        if !(temperature > 0.0 && temperature.is_finite()) {
            return Err(ModelError::InvalidTemperature(temperature));
        }

        let dim = embeddings[0].values.len();
        let mut sums: BTreeMap<&str, (Vec<f32>, usize)> = BTreeMap::new();
        for (embedding, label) in embeddings.iter().zip(labels) {
            if embedding.values.len() != dim {
                return Err(ModelError::DimensionMismatch {
                    expected: dim,
                    actual: embedding.values.len(),
                });
            }
            let normalized = embedding.normalized();
            let (sum, count) = sums
                .entry(label.as_str())
                .or_insert_with(|| (vec![0.0; dim], 0));
            for (s, v) in sum.iter_mut().zip(&normalized.values) {
                *s += v;
            }
            *count += 1;
        }

        let mut classes = Vec::with_capacity(sums.len());
        let mut centroids = Vec::with_capacity(sums.len());
        for (label, (sum, count)) in sums {
            let mean = Embedding {
                values: sum.iter().map(|s| s / count as f32).collect(),
            };
            classes.push(label.to_string());
            centroids.push(mean.normalized().values);
        }

        tracing::info!(classes = classes.len(), dim, "fitted centroid classifier");

        Ok(Self {
            version: ARTIFACT_VERSION,
            classes,
            centroids,
            temperature,
        })
    }

    /// Class names in encoder order.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn dimension(&self) -> usize {
        self.centroids.first().map_or(0, Vec::len)
    }

    /// Class probabilities for one embedding, in encoder order.
    pub fn predict_proba(&self, embedding: &Embedding) -> Result<Vec<f32>, ModelError> {
        if embedding.values.len() != self.dimension() {
            return Err(ModelError::DimensionMismatch {
                expected: self.dimension(),
                actual: embedding.values.len(),
            });
        }
        let query = embedding.normalized();
        let logits: Vec<f32> = self
            .centroids
            .iter()
            .map(|c| {
                let d2: f32 = c
                    .iter()
                    .zip(&query.values)
                    .map(|(a, b)| (a - b).powi(2))
                    .sum();
                -d2 / self.temperature
            })
            .collect();

        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f32 = exps.iter().sum();
        Ok(exps.iter().map(|e| e / total).collect())
    }

    /// Most probable class for one embedding.
    pub fn predict(&self, embedding: &Embedding) -> Result<Prediction, ModelError> {
        let proba = self.predict_proba(embedding)?;
        let (best, confidence) = proba
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

        let centroid = Embedding {
            values: self.centroids[best].clone(),
        };
        Ok(Prediction {
            label: self.classes[best].clone(),
            confidence,
            distance: embedding.normalized().euclidean_distance(&centroid),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Err(ModelError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let model: Self = serde_json::from_str(&raw)?;
        if model.version != ARTIFACT_VERSION {
            return Err(ModelError::UnsupportedVersion(model.version));
        }
        if model.classes.len() != model.centroids.len() || model.classes.is_empty() {
            return Err(ModelError::LengthMismatch {
                embeddings: model.centroids.len(),
                labels: model.classes.len(),
            });
        }
        tracing::info!(
            path = %path.display(),
            classes = ?model.classes,
            "loaded classifier"
        );
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::info!(path = %path.display(), "saved classifier");
        Ok(())
    }
}
