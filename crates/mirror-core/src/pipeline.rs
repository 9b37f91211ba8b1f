//! Classifier built from an embedder and a fitted [`ClassifierModel`].

use crate::classifier::{Classifier, ClassifierError, Diagnostic};
use crate::model::ClassifierModel;
use crate::types::{Embedding, Observation};

/// Locates faces in a frame and embeds each of them.
pub trait FaceEmbedder {
    /// `Ok(None)` when no face is present.
    fn embed(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Vec<Embedding>>, ClassifierError>;
}

pub struct EmbeddingClassifier<E> {
    embedder: E,
    model: ClassifierModel,
    diagnostics: Vec<Diagnostic>,
}

impl<E: FaceEmbedder> EmbeddingClassifier<E> {
    pub fn new(embedder: E, model: ClassifierModel) -> Self {
        Self {
            embedder,
            model,
            diagnostics: Vec::new(),
        }
    }
}

impl<E: FaceEmbedder> Classifier for EmbeddingClassifier<E> {
    fn infer(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Vec<Observation>>, ClassifierError> {
        self.diagnostics.clear();

        let Some(embeddings) = self.embedder.embed(pixels, width, height)? else {
            return Ok(None);
        };

        let mut observations = Vec::with_capacity(embeddings.len());
        for embedding in &embeddings {
            let prediction = self
                .model
                .predict(embedding)
                .map_err(|e| ClassifierError::InferenceFailed(e.to_string()))?;
            self.diagnostics.push(Diagnostic {
                label: prediction.label.clone(),
                distance_from_mean: prediction.distance,
            });
            observations.push(Observation::new(prediction.label, prediction.confidence));
        }
        Ok(Some(observations))
    }

    fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}
