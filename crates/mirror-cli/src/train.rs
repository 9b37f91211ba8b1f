//! Offline classifier training.
//!
//! Runs the external embedding pipeline over a directory of labelled face
//! images (`<input>/<person>/<image>`), then fits and saves the classifier
//! the daemon loads at startup.

use mirror_core::{ClassifierModel, Embedding, ModelError};
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Embedding cache the pipeline keeps in the input directory.
const CACHE_FILE: &str = "cache.t7";
const LABELS_FILE: &str = "labels.csv";
const REPS_FILE: &str = "reps.csv";
pub const CLASSIFIER_FILE: &str = "classifier.json";

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to run embedding pipeline {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("embedding pipeline exited with {0}")]
    PipelineFailed(std::process::ExitStatus),
    #[error("{file}:{line}: {message}")]
    Csv {
        file: String,
        line: usize,
        message: String,
    },
    #[error("classifier: {0}")]
    Model(#[from] ModelError),
}

pub struct TrainOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub pipeline: PathBuf,
    pub network: PathBuf,
    pub cuda: bool,
    pub skip_pipeline: bool,
}

/// Full training run. Returns the path of the saved classifier.
pub fn train(opts: &TrainOptions) -> Result<PathBuf, TrainError> {
    if !opts.skip_pipeline {
        invalidate_cache(&opts.input)?;
        run_pipeline(opts)?;
    }

    tracing::info!(dir = %opts.output.display(), "loading embeddings");
    let labels = read_labels(&opts.output.join(LABELS_FILE))?;
    let embeddings = read_reps(&opts.output.join(REPS_FILE))?;

    let model = ClassifierModel::fit(&embeddings, &labels)?;
    tracing::info!(classes = model.classes().len(), "trained classifier");

    let path = opts.output.join(CLASSIFIER_FILE);
    model.save(&path)?;
    Ok(path)
}

/// Remove the pipeline's cache so it rescans the image directory.
pub fn invalidate_cache(input: &Path) -> Result<bool, TrainError> {
    let cache = input.join(CACHE_FILE);
    if cache.exists() {
        std::fs::remove_file(&cache)?;
        tracing::info!(path = %cache.display(), "removed embedding cache");
        return Ok(true);
    }
    Ok(false)
}

fn pipeline_command(opts: &TrainOptions) -> Command {
    let mut cmd = Command::new(&opts.pipeline);
    cmd.arg("-data")
        .arg(&opts.input)
        .arg("-outDir")
        .arg(&opts.output)
        .arg("-model")
        .arg(&opts.network);
    if opts.cuda {
        cmd.arg("-cuda");
    }
    cmd
}

fn run_pipeline(opts: &TrainOptions) -> Result<(), TrainError> {
    tracing::info!(
        pipeline = %opts.pipeline.display(),
        input = %opts.input.display(),
        cuda = opts.cuda,
        "running embedding pipeline"
    );
    let status = pipeline_command(opts)
        .status()
        .map_err(|source| TrainError::Spawn {
            program: opts.pipeline.display().to_string(),
            source,
        })?;
    if !status.success() {
        return Err(TrainError::PipelineFailed(status));
    }
    Ok(())
}

/// Labels from `labels.csv`: the second column is an image path, and the
/// label is the name of the directory holding that image.
pub fn read_labels(path: &Path) -> Result<Vec<String>, TrainError> {
    let raw = std::fs::read_to_string(path)?;
    let file = path.display().to_string();
    let mut labels = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let csv_err = |message: &str| TrainError::Csv {
            file: file.clone(),
            line: i + 1,
            message: message.to_string(),
        };
        let image = line
            .split(',')
            .nth(1)
            .map(str::trim)
            .ok_or_else(|| csv_err("expected two columns"))?;
        let label = Path::new(image)
            .parent()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
            .ok_or_else(|| csv_err("image path has no parent directory"))?;
        labels.push(label.to_string());
    }
    Ok(labels)
}

/// Embeddings from `reps.csv`, one comma-separated vector per line.
pub fn read_reps(path: &Path) -> Result<Vec<Embedding>, TrainError> {
    let raw = std::fs::read_to_string(path)?;
    let mut reps = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let values = line
            .split(',')
            .map(|v| v.trim().parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TrainError::Csv {
                file: path.display().to_string(),
                line: i + 1,
                message: e.to_string(),
            })?;
        reps.push(Embedding { values });
    }
    Ok(reps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_read_labels_uses_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            LABELS_FILE,
            "1,./aligned/alice/001.png\n1,./aligned/alice/002.png\n2,./aligned/bob/001.png\n",
        );
        assert_eq!(read_labels(&path).unwrap(), vec!["alice", "alice", "bob"]);
    }

    #[test]
    fn test_read_labels_rejects_single_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), LABELS_FILE, "1,./a/x.png\njust-one-column\n");
        let err = read_labels(&path).unwrap_err();
        assert!(matches!(err, TrainError::Csv { line: 2, .. }));
    }

    #[test]
    fn test_read_reps() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), REPS_FILE, "0.1,0.2,0.3\n\n-0.5, 0.5, 0\n");
        let reps = read_reps(&path).unwrap();
        assert_eq!(reps.len(), 2);
        assert_eq!(reps[1].values, vec![-0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_read_reps_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), REPS_FILE, "0.1,nope\n");
        assert!(matches!(read_reps(&path), Err(TrainError::Csv { line: 1, .. })));
    }

    #[test]
    fn test_invalidate_cache() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!invalidate_cache(dir.path()).unwrap());
        write(dir.path(), CACHE_FILE, "stale");
        assert!(invalidate_cache(dir.path()).unwrap());
        assert!(!dir.path().join(CACHE_FILE).exists());
    }

    #[test]
    fn test_pipeline_command_arguments() {
        let opts = TrainOptions {
            input: "/data/faces".into(),
            output: "/data/out".into(),
            pipeline: "/opt/openface/main.lua".into(),
            network: "/opt/openface/nn4.small2.v1.t7".into(),
            cuda: true,
            skip_pipeline: false,
        };
        let cmd = pipeline_command(&opts);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "-data", "/data/faces", "-outDir", "/data/out", "-model",
                "/opt/openface/nn4.small2.v1.t7", "-cuda",
            ]
        );
    }

    #[test]
    fn test_train_from_existing_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), LABELS_FILE, "1,a/alice/1.png\n1,a/alice/2.png\n2,a/bob/1.png\n");
        write(dir.path(), REPS_FILE, "1,0\n0.9,0.1\n0,1\n");
        let opts = TrainOptions {
            input: dir.path().to_path_buf(),
            output: dir.path().to_path_buf(),
            pipeline: "/nonexistent".into(),
            network: "/nonexistent".into(),
            cuda: false,
            skip_pipeline: true,
        };

        let saved = train(&opts).unwrap();
        let model = ClassifierModel::load(&saved).unwrap();
        assert_eq!(model.classes(), &["alice".to_string(), "bob".to_string()]);
        assert_eq!(model.predict(&Embedding { values: vec![0.0, 1.0] }).unwrap().label, "bob");
    }

    #[test]
    fn test_train_reports_missing_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let opts = TrainOptions {
            input: dir.path().to_path_buf(),
            output: dir.path().to_path_buf(),
            pipeline: dir.path().join("no-such-pipeline"),
            network: "/nonexistent".into(),
            cuda: false,
            skip_pipeline: false,
        };
        assert!(matches!(train(&opts), Err(TrainError::Spawn { .. })));
    }

    #[test]
    fn test_train_rejects_mismatched_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), LABELS_FILE, "1,a/alice/1.png\n");
        write(dir.path(), REPS_FILE, "1,0\n0,1\n");
        let opts = TrainOptions {
            input: dir.path().to_path_buf(),
            output: dir.path().to_path_buf(),
            pipeline: "/nonexistent".into(),
            network: "/nonexistent".into(),
            cuda: false,
            skip_pipeline: true,
        };
        assert!(matches!(
            train(&opts),
            Err(TrainError::Model(ModelError::LengthMismatch { .. }))
        ));
    }
}
