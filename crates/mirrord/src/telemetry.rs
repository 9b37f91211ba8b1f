//! Per-frame telemetry sinks.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("no subscribers left")]
    Closed,
}

/// What the loop saw and concluded for one processed frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FrameReport {
    pub sequence: u32,
    /// Labels handed to the smoother, after the confidence threshold.
    pub labels: Vec<String>,
    pub confidences: Vec<f32>,
    /// Smoothed heat.
    pub heat: u32,
    /// Smoothed identity (`"none"` when nobody is tracked).
    pub current: String,
}

impl FrameReport {
    /// The one-line overlay shown on the mirror's debug view.
    pub fn overlay(&self) -> String {
        let confidences: Vec<String> = self.confidences.iter().map(|c| format!("{c:.2}")).collect();
        format!(
            "P: {:?} C: {:?} => {}:{}",
            self.labels, confidences, self.heat, self.current
        )
    }
}

/// Consumer of frame reports. Failures are logged by the loop and never stop it.
pub trait TelemetrySink {
    fn publish(&mut self, report: &FrameReport) -> Result<(), SinkError>;
}

/// Writes the overlay line to the log.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn publish(&mut self, report: &FrameReport) -> Result<(), SinkError> {
        tracing::debug!(seq = report.sequence, "{}", report.overlay());
        Ok(())
    }
}

/// Keeps the latest report for the D-Bus status call. Publishing succeeds
/// whether or not anyone is subscribed.
pub struct WatchSink {
    tx: watch::Sender<FrameReport>,
}

impl WatchSink {
    pub fn channel() -> (Self, watch::Receiver<FrameReport>) {
        let (tx, rx) = watch::channel(FrameReport {
            current: mirror_core::NONE_LABEL.to_string(),
            ..Default::default()
        });
        (Self { tx }, rx)
    }
}

impl TelemetrySink for WatchSink {
    fn publish(&mut self, report: &FrameReport) -> Result<(), SinkError> {
        self.tx.send_replace(report.clone());
        Ok(())
    }
}

/// Publishes to every sink, even when an earlier one fails.
impl TelemetrySink for Vec<Box<dyn TelemetrySink + Send>> {
    fn publish(&mut self, report: &FrameReport) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in self.iter_mut() {
            if let Err(e) = sink.publish(report) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> FrameReport {
        FrameReport {
            sequence: 7,
            labels: vec!["alice".into(), "unknown".into()],
            confidences: vec![0.912, 0.3],
            heat: 4,
            current: "alice".into(),
        }
    }

    #[test]
    fn test_overlay_format() {
        assert_eq!(
            report().overlay(),
            r#"P: ["alice", "unknown"] C: ["0.91", "0.30"] => 4:alice"#
        );
    }

    #[test]
    fn test_watch_sink_keeps_latest() {
        let (mut sink, rx) = WatchSink::channel();
        assert_eq!(rx.borrow().current, "none");
        sink.publish(&report()).unwrap();
        assert_eq!(rx.borrow().heat, 4);
    }

    #[test]
    fn test_watch_sink_without_subscribers() {
        let (mut sink, rx) = WatchSink::channel();
        drop(rx);
        sink.publish(&report()).unwrap();
        // A late subscriber still sees the most recent report.
        assert_eq!(sink.tx.subscribe().borrow().sequence, 7);
    }

    struct Closed;

    impl TelemetrySink for Closed {
        fn publish(&mut self, _: &FrameReport) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    #[test]
    fn test_fan_out_continues_after_failure() {
        let (open, open_rx) = WatchSink::channel();
        let mut sinks: Vec<Box<dyn TelemetrySink + Send>> =
            vec![Box::new(Closed), Box::new(TracingSink), Box::new(open)];
        assert!(sinks.publish(&report()).is_err());
        assert_eq!(open_rx.borrow().sequence, 7);
    }

    #[test]
    fn test_fan_out_with_orphaned_watch_sink() {
        let (watch, rx) = WatchSink::channel();
        drop(rx);
        let mut sinks: Vec<Box<dyn TelemetrySink + Send>> =
            vec![Box::new(TracingSink), Box::new(watch)];
        for _ in 0..3 {
            sinks.publish(&report()).unwrap();
        }
    }
}
