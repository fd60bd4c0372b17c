//! Frame ingestion sources.
//!
//! This module provides the sources a stream can capture from:
//! - Local V4L2 devices (feature: ingest-v4l2), probed over a small set of indices
//! - Synthetic source (`stub://` devices, bring-up and testing)
//!
//! All sources implement `FrameSource` and produce RGB24 `Frame`s.
//! A source is responsible for:
//! - Opening the device with a minimal buffer depth so reads return the freshest frame
//! - Bounding each read by a timeout
//! - Releasing the device on `close()`
//!
//! A source MUST NOT retry internally. Reopen and backoff decisions belong to the
//! orchestrator (see `CaptureRecovery`) so they can be paced and observed.

mod camera;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::time::Duration;

use crate::frame::Frame;

pub use camera::{CameraConfig, CameraSource, CameraStats};

/// Capture device failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceError {
    /// No device could be opened (fatal to the current attempt, retryable).
    Unavailable(String),
    /// The device is open but a read produced no frame.
    ReadFailed(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::Unavailable(reason) => write!(f, "capture device unavailable: {}", reason),
            DeviceError::ReadFailed(reason) => write!(f, "frame read failed: {}", reason),
        }
    }
}

impl std::error::Error for DeviceError {}

/// A capture device.
///
/// `next_frame` blocks for at most the source's read timeout, so callers run it
/// on a blocking worker rather than on the async loop.
pub trait FrameSource: Send {
    /// Open (or re-open) the device.
    fn open(&mut self) -> Result<(), DeviceError>;

    /// Read the most recent frame.
    fn next_frame(&mut self) -> Result<Frame, DeviceError>;

    /// Release the device. Closing a closed source is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Human-readable device description for logs.
    fn describe(&self) -> String;
}

// ----------------------------------------------------------------------------
// Reopen / backoff policy
// ----------------------------------------------------------------------------

/// Capture failure recovery settings.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturePolicy {
    /// Consecutive read failures tolerated before the device is reopened.
    pub read_retries: u32,
    /// Delay before reopening after a failure.
    pub reopen_backoff: Duration,
    /// Consecutive failed opens before switching to `long_backoff`.
    pub max_reopen_attempts: u32,
    pub long_backoff: Duration,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            read_retries: 3,
            reopen_backoff: Duration::from_millis(100),
            max_reopen_attempts: 5,
            long_backoff: Duration::from_secs(1),
        }
    }
}

/// What the capture loop should do after a read failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Read again without touching the device.
    RetryRead,
    /// Close the device and open it again after `backoff`.
    Reopen { backoff: Duration },
}

/// Per-session failure counters driving `CapturePolicy`.
#[derive(Debug)]
pub struct CaptureRecovery {
    policy: CapturePolicy,
    read_failures: u32,
    open_failures: u32,
}

impl CaptureRecovery {
    pub fn new(policy: CapturePolicy) -> Self {
        Self {
            policy,
            read_failures: 0,
            open_failures: 0,
        }
    }

    pub fn on_frame(&mut self) {
        self.read_failures = 0;
    }

    pub fn on_open(&mut self) {
        self.open_failures = 0;
    }

    pub fn on_read_failure(&mut self) -> RecoveryAction {
        self.read_failures += 1;
        if self.read_failures <= self.policy.read_retries {
            RecoveryAction::RetryRead
        } else {
            self.read_failures = 0;
            RecoveryAction::Reopen {
                backoff: self.policy.reopen_backoff,
            }
        }
    }

    /// Returns the delay before the next open attempt.
    pub fn on_open_failure(&mut self) -> Duration {
        self.read_failures = 0;
        self.open_failures += 1;
        if self.open_failures >= self.policy.max_reopen_attempts {
            self.open_failures = 0;
            self.policy.long_backoff
        } else {
            self.policy.reopen_backoff
        }
    }
}
