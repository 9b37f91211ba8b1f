//! mirror-core — Identity tracking engine for the smart mirror.
//!
//! Turns noisy per-frame face classifications into a debounced
//! "who is in front of the mirror" signal, and defines the contract
//! for the classifier that feeds it.

pub mod alignment;
pub mod classifier;
pub mod detector;
pub mod embedder;
pub mod model;
pub mod pipeline;
pub mod smoother;
pub mod types;

pub use classifier::{apply_threshold, Classifier, ClassifierError};
pub use model::{ClassifierModel, ModelError};
pub use pipeline::{EmbeddingClassifier, FaceEmbedder};
pub use smoother::{IdentitySmoother, SmootherConfig, SmootherConfigError};
pub use types::{Embedding, FaceBox, Observation, NONE_LABEL, UNKNOWN_LABEL};

/// Default directory for model files (`$XDG_DATA_HOME/mirror/models`).
pub fn default_model_dir() -> std::path::PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        });
    data_dir.join("mirror").join("models")
}
