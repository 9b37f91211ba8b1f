use mirror_core::SmootherConfig;
use mirror_hw::{Roi, VideoDevice};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid smoother config: {0}")]
    Smoother(#[from] mirror_core::SmootherConfigError),
}

/// Daemon configuration: defaults, then an optional TOML file, then
/// `MIRROR_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Camera index (`/dev/videoN`) or device path (default: 0).
    pub video_device: VideoDevice,
    /// Resolution requested from the camera; driver default when unset.
    pub resolution: Option<(u32, u32)>,
    /// Face window as fractions of the frame; full frame when unset.
    pub roi: Option<Roi>,
    /// Directory containing the embedding model and the fitted classifier.
    pub model_dir: PathBuf,
    /// Fitted classifier (default: `<model_dir>/classifier.json`).
    pub classifier_path: Option<PathBuf>,
    /// ONNX embedding network (default: `<model_dir>/openface.onnx`).
    pub embedder_model: Option<PathBuf>,
    /// SCRFD face detector (default: `<model_dir>/det_10g.onnx`).
    pub detector_model: Option<PathBuf>,
    /// Observations at or below this confidence are relabelled unknown.
    pub threshold: f32,
    pub unknown_label: String,
    /// Sleep between mode checks while paused.
    pub pause_interval_ms: u64,
    /// Consecutive capture failures tolerated before giving up on the camera.
    pub max_capture_failures: u32,
    /// Frames discarded at startup while the camera settles exposure.
    pub warmup_frames: usize,
    /// Mean brightness below which the face window is skipped without
    /// running the detector.
    pub presence_floor: f32,
    pub smoother: SmootherConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            video_device: VideoDevice::default(),
            resolution: None,
            roi: None,
            model_dir: mirror_core::default_model_dir(),
            classifier_path: None,
            embedder_model: None,
            detector_model: None,
            threshold: 0.5,
            unknown_label: mirror_core::UNKNOWN_LABEL.to_string(),
            pause_interval_ms: 300,
            max_capture_failures: 10,
            warmup_frames: 4,
            presence_floor: 20.0,
            smoother: SmootherConfig::default(),
        }
    }
}

impl Config {
    /// Load from the config file (if any) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_file() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw)?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Override fields from `MIRROR_*` variables; `var` looks a key up.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("MIRROR_VIDEO_DEVICE") {
            if let Ok(device) = v.parse() {
                self.video_device = device;
            }
        }
        if let Some(v) = var("MIRROR_RESOLUTION") {
            match parse_resolution(&v) {
                Some(res) => self.resolution = Some(res),
                None => tracing::warn!(value = %v, "ignoring MIRROR_RESOLUTION; expected WIDTHxHEIGHT"),
            }
        }
        if let Some(v) = var("MIRROR_ROI") {
            match parse_roi(&v) {
                Some(roi) => self.roi = Some(roi),
                None => tracing::warn!(value = %v, "ignoring MIRROR_ROI; expected x0,y0,x1,y1 in [0, 1]"),
            }
        }
        if let Some(v) = var("MIRROR_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("MIRROR_CLASSIFIER_PATH") {
            self.classifier_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("MIRROR_EMBEDDER_MODEL") {
            self.embedder_model = Some(PathBuf::from(v));
        }
        if let Some(v) = var("MIRROR_DETECTOR_MODEL") {
            self.detector_model = Some(PathBuf::from(v));
        }
        if let Some(v) = var("MIRROR_UNKNOWN_LABEL") {
            self.unknown_label = v;
        }
        override_parsed(&var, "MIRROR_THRESHOLD", &mut self.threshold);
        override_parsed(&var, "MIRROR_PAUSE_INTERVAL_MS", &mut self.pause_interval_ms);
        override_parsed(&var, "MIRROR_MAX_CAPTURE_FAILURES", &mut self.max_capture_failures);
        override_parsed(&var, "MIRROR_WARMUP_FRAMES", &mut self.warmup_frames);
        override_parsed(&var, "MIRROR_PRESENCE_FLOOR", &mut self.presence_floor);
        override_parsed(&var, "MIRROR_HEAT_CAP", &mut self.smoother.heat_cap);
        override_parsed(&var, "MIRROR_REWARD", &mut self.smoother.reward);
        override_parsed(&var, "MIRROR_DECAY", &mut self.smoother.decay);
        override_parsed(&var, "MIRROR_SWITCH_THRESHOLD", &mut self.smoother.switch_threshold);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::Invalid(format!(
                "threshold must be in [0, 1], got {}",
                self.threshold
            )));
        }
        if self.unknown_label.trim().is_empty() {
            return Err(ConfigError::Invalid("unknown_label must not be blank".into()));
        }
        if self.pause_interval_ms == 0 {
            return Err(ConfigError::Invalid("pause_interval_ms must be positive".into()));
        }
        if self.max_capture_failures == 0 {
            return Err(ConfigError::Invalid("max_capture_failures must be positive".into()));
        }
        if let Some((w, h)) = self.resolution {
            if w == 0 || h == 0 {
                return Err(ConfigError::Invalid(format!("resolution {w}x{h} is empty")));
            }
        }
        self.smoother.validate()?;
        Ok(())
    }

    pub fn classifier_path(&self) -> PathBuf {
        self.classifier_path
            .clone()
            .unwrap_or_else(|| self.model_dir.join("classifier.json"))
    }

    pub fn embedder_model_path(&self) -> PathBuf {
        self.embedder_model
            .clone()
            .unwrap_or_else(|| self.model_dir.join("openface.onnx"))
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.detector_model
            .clone()
            .unwrap_or_else(|| self.model_dir.join("det_10g.onnx"))
    }

    pub fn pause_interval(&self) -> Duration {
        Duration::from_millis(self.pause_interval_ms)
    }
}

/// `MIRROR_CONFIG`, else `$XDG_CONFIG_HOME/mirror/mirrord.toml` when it exists.
fn config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("MIRROR_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    let path = config_dir.join("mirror").join("mirrord.toml");
    path.exists().then_some(path)
}

fn override_parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    field: &mut T,
) {
    if let Some(v) = var(key) {
        match v.parse() {
            Ok(parsed) => *field = parsed,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparsable override"),
        }
    }
}

fn parse_resolution(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn parse_roi(s: &str) -> Option<Roi> {
    let parts: Vec<f32> = s
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    let [x0, y0, x1, y1] = parts.as_slice() else {
        return None;
    };
    Roi::new(*x0, *y0, *x1, *y1).ok()
}
