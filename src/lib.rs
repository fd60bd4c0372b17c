//! Face-recognition door controller (facegate)
//!
//! This crate implements the real-time core of a camera-driven access point.
//!
//! # Architecture
//!
//! ```text
//!  observers attach ──► EventHub ──(0→1)──► StreamOrchestrator
//!                          ▲                    │
//!                          │      loop { capture → recognize? → unlock? → encode → publish }
//!                          │                    │
//!                          └──── frame / recognition / door events ◄──┘
//!                                               │
//!                                       DoorAutomation ──► Actuator (relay)
//! ```
//!
//! The pipeline never lets a slow observer stall capture, never actuates the
//! lock redundantly, and keeps the relock timer independent of whether anyone
//! is watching.
//!
//! # Module Structure
//!
//! - `frame`: RGB frame buffer owned by one loop iteration
//! - `ingest`: frame sources (V4L2 devices, synthetic `stub://` source) and reopen policy
//! - `detect`: matcher capability, identity store, recognition gate
//! - `encode`: load-adaptive JPEG encoding with annotations
//! - `door`: lock actuator and the unlock/relock state machine
//! - `hub`: observer fan-out
//! - `orchestrator`: capture loop lifecycle
//! - `controller`: the operations exposed to a transport layer
//! - `api`: newline-delimited JSON control and event socket
//! - `config`: daemon configuration (file + environment overrides)
//! - `settings`: performance profile and access policy
//! - `worker`: bounded pool for blocking recognition and encoding work
//! - `log`: bounded recognition log
//! - Core types: `BoundingBox`, `Detection`

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod controller;
pub mod detect;
pub mod door;
pub mod encode;
pub mod frame;
pub mod hub;
pub mod ingest;
pub mod log;
pub mod orchestrator;
pub mod settings;
pub mod worker;

pub use controller::{AccessController, ControllerConfig, ControllerParts};
pub use detect::{IdentityStore, InMemoryIdentityStore, Matcher, MatcherError, RecognitionGate};
pub use door::{Actuator, ActuatorError, DoorAutomation, DoorStatus, DryRunActuator};
pub use encode::{choose_quality, LoadAdaptiveEncoder, LoadSampler, SystemLoad};
pub use frame::Frame;
pub use hub::{DeliveryError, EventHub, HubConfig, OutboundEvent};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::v4l2::V4l2Device;
pub use ingest::{CameraConfig, CameraSource, CapturePolicy, DeviceError, FrameSource};
pub use orchestrator::{StreamOrchestrator, StreamState};
pub use settings::{AccessPolicy, Pacing, PerformanceProfile, ProfileUpdate};

/// Name of an enrolled identity.
pub type Name = String;

/// Milliseconds since the Unix epoch, used for event timestamps.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// -------------------- Geometry --------------------

/// Face bounding box in pixel coordinates (`right`/`bottom` exclusive).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Scale coordinates by an integer factor (recognition runs on a downscaled frame).
    pub fn scaled(self, factor: u32) -> Self {
        Self {
            top: self.top.saturating_mul(factor),
            right: self.right.saturating_mul(factor),
            bottom: self.bottom.saturating_mul(factor),
            left: self.left.saturating_mul(factor),
        }
    }

    /// Clip the box to a `width` x `height` frame.
    pub fn clamped(self, width: u32, height: u32) -> Self {
        Self {
            top: self.top.min(height),
            right: self.right.min(width),
            bottom: self.bottom.min(height),
            left: self.left.min(width),
        }
    }
}

// -------------------- Detections --------------------

/// One face found in a recognized frame.
///
/// `confidence` is only meaningful when `identity` is present; unknown faces
/// carry `0.0` and are never authorized.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Detection {
    #[serde(rename = "name")]
    pub identity: Option<Name>,
    pub confidence: f32,
    #[serde(rename = "is_authorized")]
    pub authorized: bool,
    #[serde(rename = "location")]
    pub bounding_box: BoundingBox,
}

impl Detection {
    pub fn unknown(bounding_box: BoundingBox) -> Self {
        Self {
            identity: None,
            confidence: 0.0,
            authorized: false,
            bounding_box,
        }
    }

    pub fn identified(
        name: impl Into<Name>,
        confidence: f32,
        authorized: bool,
        bounding_box: BoundingBox,
    ) -> Self {
        Self {
            identity: Some(name.into()),
            confidence: confidence.clamp(0.0, 1.0),
            authorized,
            bounding_box,
        }
    }

    pub fn is_known(&self) -> bool {
        self.identity.is_some()
    }

    /// Overlay label, e.g. `ALICE (91.2%)` or `Unknown`.
    pub fn label(&self) -> String {
        match &self.identity {
            Some(name) if self.confidence > 0.0 => {
                format!("{} ({:.1}%)", name, self.confidence * 100.0)
            }
            Some(name) => name.clone(),
            None => "Unknown".to_string(),
        }
    }
}
