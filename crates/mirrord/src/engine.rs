use std::time::Duration;

use mirror_core::classifier::apply_threshold;
use mirror_core::detector::FaceDetector;
use mirror_core::embedder::OnnxEmbedder;
use mirror_core::{
    Classifier, ClassifierModel, EmbeddingClassifier, IdentitySmoother, Observation,
    SmootherConfig,
};
use mirror_hw::{Camera, CameraError, CaptureDevice, Roi};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::mode::{CancelToken, Mode, ModeFlag, ModeReader};
use crate::telemetry::{FrameReport, TelemetrySink};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("camera lost after {failures} consecutive capture failures: {source}")]
    CaptureLost {
        failures: u32,
        #[source]
        source: CameraError,
    },
    #[error("classifier error: {0}")]
    Classifier(#[from] mirror_core::ClassifierError),
    #[error("model error: {0}")]
    Model(#[from] mirror_core::ModelError),
    #[error("smoother config: {0}")]
    Smoother(#[from] mirror_core::SmootherConfigError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
}

/// Knobs of the capture loop that are not smoother constants.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub roi: Option<Roi>,
    pub threshold: f32,
    pub unknown_label: String,
    pub pause_interval: Duration,
    pub max_capture_failures: u32,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            roi: None,
            threshold: 0.5,
            unknown_label: mirror_core::UNKNOWN_LABEL.to_string(),
            pause_interval: Duration::from_millis(300),
            max_capture_failures: 10,
        }
    }
}

impl From<&Config> for LoopSettings {
    fn from(config: &Config) -> Self {
        Self {
            roi: config.roi,
            threshold: config.threshold,
            unknown_label: config.unknown_label.clone(),
            pause_interval: config.pause_interval(),
            max_capture_failures: config.max_capture_failures,
        }
    }
}

/// Capture device handed to [`ModeLoop::run`].
pub enum CaptureSource<'a> {
    /// Opened for the loop; released when the loop returns.
    Owned(Box<dyn CaptureDevice + Send>),
    /// Owned by the caller; never released by the loop.
    Borrowed(&'a mut dyn CaptureDevice),
}

/// Releases an owned capture device exactly once, on every exit path.
struct CaptureGuard<'a> {
    source: CaptureSource<'a>,
}

impl<'a> CaptureGuard<'a> {
    fn device(&mut self) -> &mut (dyn CaptureDevice + 'a) {
        match &mut self.source {
            CaptureSource::Owned(device) => device.as_mut(),
            CaptureSource::Borrowed(device) => &mut **device,
        }
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        if let CaptureSource::Owned(device) = &mut self.source {
            device.release();
        }
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was captured and folded into the smoother.
    Detected,
    /// Capture failed; the next tick retries.
    CaptureFailed,
    /// Paused; slept without touching camera or classifier.
    Paused,
    /// The mode is terminal; the loop should stop.
    Exit(Mode),
}

/// Why [`ModeLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The host moved the mode out of detect/paused.
    Terminal(Mode),
    /// The cancel token fired; the mode was set to abort.
    Aborted,
}

/// The detect/pause/abort capture loop around the smoother.
pub struct ModeLoop<C> {
    mode: ModeReader,
    cancel: CancelToken,
    classifier: C,
    smoother: IdentitySmoother,
    sink: Box<dyn TelemetrySink + Send>,
    settings: LoopSettings,
    consecutive_failures: u32,
}

impl<C: Classifier> ModeLoop<C> {
    pub fn new(
        mode: ModeReader,
        cancel: CancelToken,
        classifier: C,
        smoother: SmootherConfig,
        sink: Box<dyn TelemetrySink + Send>,
        settings: LoopSettings,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            mode,
            cancel,
            classifier,
            smoother: IdentitySmoother::new(smoother)?,
            sink,
            settings,
            consecutive_failures: 0,
        })
    }

    #[cfg(test)]
    pub fn smoother(&self) -> &IdentitySmoother {
        &self.smoother
    }

    /// Run until the mode turns terminal or the cancel token fires.
    ///
    /// Starts a fresh smoothing session. An owned capture device is released
    /// before this returns, whichever way it returns.
    pub fn run(&mut self, capture: CaptureSource<'_>) -> Result<LoopExit, EngineError> {
        self.smoother.reset();
        self.consecutive_failures = 0;
        let mut guard = CaptureGuard { source: capture };
        let (width, height) = guard.device().resolution();
        tracing::info!(mode = %self.mode.get(), width, height, "capture loop started");

        loop {
            if self.cancel.is_cancelled() {
                self.mode.abort();
                tracing::info!("capture loop interrupted; mode set to abort");
                return Ok(LoopExit::Aborted);
            }
            if let TickOutcome::Exit(mode) = self.tick(guard.device())? {
                tracing::info!(mode = %mode, "capture loop finished");
                return Ok(LoopExit::Terminal(mode));
            }
        }
    }

    /// One iteration: act on the current mode.
    pub fn tick(&mut self, device: &mut dyn CaptureDevice) -> Result<TickOutcome, EngineError> {
        match self.mode.get() {
            Mode::Detect => self.detect_frame(device),
            Mode::Paused => {
                self.cancel.wait(self.settings.pause_interval);
                Ok(TickOutcome::Paused)
            }
            other => Ok(TickOutcome::Exit(other)),
        }
    }

    fn detect_frame(&mut self, device: &mut dyn CaptureDevice) -> Result<TickOutcome, EngineError> {
        tracing::trace!("grabbing frame");
        let frame = match device.read() {
            Ok(frame) => {
                self.consecutive_failures = 0;
                frame
            }
            Err(e) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    error = %e,
                    failures = self.consecutive_failures,
                    "frame capture failed"
                );
                if self.consecutive_failures >= self.settings.max_capture_failures {
                    return Err(EngineError::CaptureLost {
                        failures: self.consecutive_failures,
                        source: e,
                    });
                }
                return Ok(TickOutcome::CaptureFailed);
            }
        };

        let observations = match frame.crop_to(self.settings.roi.as_ref()) {
            Ok(window) => match self.classifier.infer(&window.data, window.width, window.height) {
                Ok(observations) => observations,
                Err(e) => {
                    tracing::warn!(error = %e, "classifier failed; treating frame as faceless");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to crop frame; treating frame as faceless");
                None
            }
        };
        let observations = observations.map(well_formed_or_empty);

        let labels = observations
            .as_deref()
            .map(|obs| apply_threshold(obs, self.settings.threshold, &self.settings.unknown_label));
        self.smoother.detect(labels.as_deref());

        for d in self.classifier.diagnostics() {
            tracing::debug!(label = %d.label, distance = d.distance_from_mean, "distance from class mean");
        }

        let report = FrameReport {
            sequence: frame.sequence,
            labels: labels.unwrap_or_default(),
            confidences: observations
                .unwrap_or_default()
                .iter()
                .map(|o| o.confidence)
                .collect(),
            heat: self.smoother.current_value(),
            current: self.smoother.current_label().to_string(),
        };
        if let Err(e) = self.sink.publish(&report) {
            tracing::warn!(error = %e, "telemetry sink failed");
        }
        tracing::trace!(seq = frame.sequence, elapsed = ?frame.timestamp.elapsed(), "frame processed");

        Ok(TickOutcome::Detected)
    }
}

/// A batch with any malformed observation is dropped as a whole.
fn well_formed_or_empty(observations: Vec<Observation>) -> Vec<Observation> {
    if observations.iter().all(Observation::is_well_formed) {
        observations
    } else {
        tracing::warn!(
            faces = observations.len(),
            "malformed observation batch; treating frame as empty"
        );
        Vec::new()
    }
}

/// Completion handle of the engine thread.
pub struct EngineHandle {
    pub done: oneshot::Receiver<Result<LoopExit, EngineError>>,
}

/// Spawn the capture loop on a dedicated OS thread.
///
/// Opens the camera and loads both models synchronously, discards warmup
/// frames, then hands everything to the loop. Fails fast at startup if any
/// resource is unavailable.
pub fn spawn_engine(
    config: &Config,
    mode: &ModeFlag,
    cancel: CancelToken,
    sink: Box<dyn TelemetrySink + Send>,
) -> Result<EngineHandle, EngineError> {
    let mut camera = Camera::open(&config.video_device, config.resolution)?;
    let (width, height) = camera.resolution();
    tracing::info!(
        device = %config.video_device,
        width,
        height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let model = ClassifierModel::load(&config.classifier_path())?;
    let detector = FaceDetector::load(&config.detector_model_path())?;
    let embedder = OnnxEmbedder::load(&config.embedder_model_path(), detector)?
        .with_presence_floor(config.presence_floor);
    let classifier = EmbeddingClassifier::new(embedder, model);

    // Starts the capture stream; the loop keeps reading from the same one.
    if config.warmup_frames > 0 {
        tracing::info!(count = config.warmup_frames, "discarding warmup frames");
        for _ in 0..config.warmup_frames {
            if let Err(e) = camera.read() {
                tracing::debug!(error = %e, "warmup frame failed");
            }
        }
    }

    let mut mode_loop = ModeLoop::new(
        mode.reader(),
        cancel,
        classifier,
        config.smoother,
        sink,
        LoopSettings::from(config),
    )?;

    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("mirror-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let result = mode_loop.run(CaptureSource::Owned(Box::new(camera)));
            if let Err(e) = &result {
                tracing::error!(error = %e, "capture loop failed");
            }
            let _ = tx.send(result);
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { done: rx })
}
