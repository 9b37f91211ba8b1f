//! Shared capture mode and cooperative cancellation.
//!
//! The host owns a [`ModeFlag`] and moves it between modes while the loop is
//! still active. The capture loop only gets a [`ModeReader`], which can read
//! the mode and flip it to `abort`.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const RAW_DETECT: u8 = 0;
const RAW_PAUSED: u8 = 1;
const RAW_ABORT: u8 = 2;
const RAW_STOPPED: u8 = 3;

/// Operating mode of the capture loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Capture and classify every frame.
    Detect,
    /// Idle; the camera and classifier are left alone.
    Paused,
    /// The loop was interrupted.
    Abort,
    /// The host asked the loop to finish.
    Stopped,
    /// Any other raw value. Terminal, like `Abort` and `Stopped`.
    Other(u8),
}

impl Mode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            RAW_DETECT => Mode::Detect,
            RAW_PAUSED => Mode::Paused,
            RAW_ABORT => Mode::Abort,
            RAW_STOPPED => Mode::Stopped,
            other => Mode::Other(other),
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            Mode::Detect => RAW_DETECT,
            Mode::Paused => RAW_PAUSED,
            Mode::Abort => RAW_ABORT,
            Mode::Stopped => RAW_STOPPED,
            Mode::Other(raw) => raw,
        }
    }

    /// True for the modes that keep the loop running.
    pub fn is_active(self) -> bool {
        matches!(self, Mode::Detect | Mode::Paused)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Detect => f.write_str("detect"),
            Mode::Paused => f.write_str("paused"),
            Mode::Abort => f.write_str("abort"),
            Mode::Stopped => f.write_str("stopped"),
            Mode::Other(raw) => write!(f, "other({raw})"),
        }
    }
}

/// Host-side handle to the shared mode.
#[derive(Clone)]
pub struct ModeFlag(Arc<AtomicU8>);

impl ModeFlag {
    pub fn new(initial: Mode) -> Self {
        Self(Arc::new(AtomicU8::new(initial.to_raw())))
    }

    pub fn get(&self) -> Mode {
        Mode::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Unconditional write, used by tests to drive the loop into any mode.
    #[cfg(test)]
    pub fn set(&self, mode: Mode) {
        let previous = Mode::from_raw(self.0.swap(mode.to_raw(), Ordering::AcqRel));
        if previous != mode {
            tracing::info!(from = %previous, to = %mode, "mode changed");
        }
    }

    /// Atomically move to `target`, but only while the loop is still in an
    /// active mode. A concurrent `abort` from the loop is never overwritten.
    /// Returns the previous mode, or the terminal mode that blocked the move.
    pub fn transition(&self, target: Mode) -> Result<Mode, Mode> {
        let result = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Mode::from_raw(raw).is_active().then_some(target.to_raw())
            })
            .map(Mode::from_raw)
            .map_err(Mode::from_raw);
        if let Ok(previous) = result {
            if previous != target {
                tracing::info!(from = %previous, to = %target, "mode changed");
            }
        }
        result
    }

    /// Restricted view handed to the capture loop.
    pub fn reader(&self) -> ModeReader {
        ModeReader(Arc::clone(&self.0))
    }
}

/// Loop-side handle: read the mode, or abort.
#[derive(Clone)]
pub struct ModeReader(Arc<AtomicU8>);

impl ModeReader {
    pub fn get(&self) -> Mode {
        Mode::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn abort(&self) {
        self.0.store(RAW_ABORT, Ordering::Release);
    }
}

/// Cooperative cancellation signal, observed at loop iteration boundaries.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<(Mutex<bool>, Condvar)>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.0;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (flag, _) = &*self.0;
        let cancelled = *flag.lock().unwrap_or_else(|e| e.into_inner());
        cancelled
    }

    /// Sleep for `timeout`, waking early on cancellation.
    /// Returns true if the token was cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.0;
        let deadline = Instant::now() + timeout;
        let mut cancelled = flag.lock().unwrap_or_else(|e| e.into_inner());
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cancelled = match cvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        *cancelled
    }
}
