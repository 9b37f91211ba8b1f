use tokio::sync::watch;
use zbus::interface;

use crate::mode::{Mode, ModeFlag};
use crate::telemetry::FrameReport;

/// D-Bus interface for the mirror identity daemon.
///
/// Bus name: org.freedesktop.Mirror1
/// Object path: /org/freedesktop/Mirror1
pub struct MirrorService {
    pub mode: ModeFlag,
    pub latest: watch::Receiver<FrameReport>,
}

impl MirrorService {
    /// Leave detect/paused for `target`; refused once the loop has exited.
    fn switch_active(&self, target: Mode) -> zbus::fdo::Result<()> {
        self.mode.transition(target).map(|_| ()).map_err(|current| {
            zbus::fdo::Error::Failed(format!("capture loop is no longer running (mode {current})"))
        })
    }

    fn status_json(&self) -> String {
        let latest = self.latest.borrow();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mode": self.mode.get().to_string(),
            "current": latest.current,
            "heat": latest.heat,
            "frame": latest.sequence,
        })
        .to_string()
    }
}

#[interface(name = "org.freedesktop.Mirror1")]
impl MirrorService {
    /// Stop tracking without losing the tracked person (e.g. during checkout).
    async fn pause(&self) -> zbus::fdo::Result<()> {
        tracing::info!("pause requested");
        self.switch_active(Mode::Paused)
    }

    /// Resume tracking.
    async fn resume(&self) -> zbus::fdo::Result<()> {
        tracing::info!("resume requested");
        self.switch_active(Mode::Detect)
    }

    /// Ask the capture loop to finish.
    async fn stop(&self) -> zbus::fdo::Result<()> {
        tracing::info!("stop requested");
        self.switch_active(Mode::Stopped)
    }

    /// Current mode and smoothed identity as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{TelemetrySink, WatchSink};

    #[test]
    fn test_pause_and_resume() {
        let (_sink, rx) = WatchSink::channel();
        let svc = MirrorService { mode: ModeFlag::new(Mode::Detect), latest: rx };
        svc.switch_active(Mode::Paused).unwrap();
        assert_eq!(svc.mode.get(), Mode::Paused);
        svc.switch_active(Mode::Detect).unwrap();
        assert_eq!(svc.mode.get(), Mode::Detect);
    }

    #[test]
    fn test_cannot_resume_after_abort() {
        let (_sink, rx) = WatchSink::channel();
        let svc = MirrorService { mode: ModeFlag::new(Mode::Abort), latest: rx };
        assert!(svc.switch_active(Mode::Detect).is_err());
        assert_eq!(svc.mode.get(), Mode::Abort);
    }

    #[test]
    fn test_stop_keeps_abort() {
        let (_sink, rx) = WatchSink::channel();
        let svc = MirrorService { mode: ModeFlag::new(Mode::Detect), latest: rx };
        svc.mode.reader().abort();
        assert!(svc.switch_active(Mode::Stopped).is_err());
        assert!(svc.switch_active(Mode::Paused).is_err());
        assert_eq!(svc.mode.get(), Mode::Abort);
    }

    #[test]
    fn test_stop_from_paused() {
        let (_sink, rx) = WatchSink::channel();
        let svc = MirrorService { mode: ModeFlag::new(Mode::Paused), latest: rx };
        svc.switch_active(Mode::Stopped).unwrap();
        assert_eq!(svc.mode.get(), Mode::Stopped);
    }

    #[test]
    fn test_status_reflects_latest_report() {
        let (mut sink, rx) = WatchSink::channel();
        let svc = MirrorService { mode: ModeFlag::new(Mode::Paused), latest: rx };
        sink.publish(&FrameReport {
            sequence: 12,
            labels: vec!["alice".into()],
            confidences: vec![0.9],
            heat: 5,
            current: "alice".into(),
        })
        .unwrap();

        let status: serde_json::Value = serde_json::from_str(&svc.status_json()).unwrap();
        assert_eq!(status["mode"], "paused");
        assert_eq!(status["current"], "alice");
        assert_eq!(status["heat"], 5);
        assert_eq!(status["frame"], 12);
    }
}
