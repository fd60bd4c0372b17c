//! Runtime-tunable settings.
//!
//! `PerformanceProfile` and `AccessPolicy` are read every loop iteration and
//! replaced as whole records by configuration updates. `SharedSetting` holds
//! the current record behind a `watch` channel so a reader always sees either
//! the old or the new record, never a mix.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Capture pacing policy.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Sleep the remainder of `1 / target_fps` since the previous capture.
    #[default]
    FrameInterval,
    /// Capture back-to-back; CPU is bounded only by recognition skipping.
    Unthrottled,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PerformanceProfile {
    pub target_fps: f32,
    /// Recognize every Nth frame.
    pub recognition_interval: u32,
    /// Base JPEG quality before load adaptation.
    pub jpeg_quality: u8,
    pub max_frame_width: u32,
    pub adaptive_quality: bool,
    #[serde(default)]
    pub pacing: Pacing,
}

impl Default for PerformanceProfile {
    fn default() -> Self {
        Self {
            target_fps: 10.0,
            recognition_interval: 20,
            jpeg_quality: 60,
            max_frame_width: 320,
            adaptive_quality: true,
            pacing: Pacing::FrameInterval,
        }
    }
}

/// Partial profile update; absent fields keep their current value.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_fps: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recognition_interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jpeg_quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frame_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive_quality: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pacing: Option<Pacing>,
}

/// Rejected settings value.
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileError {
    pub field: &'static str,
    pub reason: String,
}

impl ProfileError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ProfileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.reason)
    }
}

impl std::error::Error for ProfileError {}

impl PerformanceProfile {
    /// Minimum spacing between captures under `Pacing::FrameInterval`.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.target_fps.max(0.1))
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if !(self.target_fps.is_finite() && self.target_fps > 0.0) {
            return Err(ProfileError::new("target_fps", "must be > 0"));
        }
        if self.target_fps > 120.0 {
            return Err(ProfileError::new("target_fps", "must be <= 120"));
        }
        if self.recognition_interval == 0 {
            return Err(ProfileError::new("recognition_interval", "must be >= 1"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(ProfileError::new("jpeg_quality", "must be within 1..=100"));
        }
        if self.max_frame_width < 32 {
            return Err(ProfileError::new("max_frame_width", "must be >= 32"));
        }
        Ok(())
    }

    /// Apply a partial update, returning the validated replacement record.
    pub fn merged(&self, update: &ProfileUpdate) -> Result<Self, ProfileError> {
        let next = Self {
            target_fps: update.target_fps.unwrap_or(self.target_fps),
            recognition_interval: update
                .recognition_interval
                .unwrap_or(self.recognition_interval),
            jpeg_quality: update.jpeg_quality.unwrap_or(self.jpeg_quality),
            max_frame_width: update.max_frame_width.unwrap_or(self.max_frame_width),
            adaptive_quality: update.adaptive_quality.unwrap_or(self.adaptive_quality),
            pacing: update.pacing.unwrap_or(self.pacing),
        };
        next.validate()?;
        Ok(next)
    }
}

/// Automatic unlock and recognition logging thresholds.
///
/// `log_confidence` decides whether an identified face is reported and logged.
/// `unlock_confidence` (together with `auto_unlock` and authorization) decides
/// whether it may open the door. The two are evaluated independently.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AccessPolicy {
    pub auto_unlock: bool,
    pub unlock_confidence: f32,
    pub log_confidence: f32,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            auto_unlock: true,
            unlock_confidence: 0.8,
            log_confidence: 0.5,
        }
    }
}

impl AccessPolicy {
    pub fn validate(&self) -> Result<(), ProfileError> {
        for (field, value) in [
            ("unlock_confidence", self.unlock_confidence),
            ("log_confidence", self.log_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ProfileError::new(field, "must be within 0.0..=1.0"));
            }
        }
        Ok(())
    }
}

/// Partial door configuration update.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_unlock: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlock_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_duration_secs: Option<u64>,
}

impl PolicyUpdate {
    pub fn merged(&self, policy: &AccessPolicy) -> Result<AccessPolicy, ProfileError> {
        let next = AccessPolicy {
            auto_unlock: self.auto_unlock.unwrap_or(policy.auto_unlock),
            unlock_confidence: self.unlock_confidence.unwrap_or(policy.unlock_confidence),
            log_confidence: self.log_confidence.unwrap_or(policy.log_confidence),
        };
        next.validate()?;
        if let Some(secs) = self.lock_duration_secs {
            validate_lock_duration(secs)?;
        }
        Ok(next)
    }
}

pub fn validate_lock_duration(secs: u64) -> Result<(), ProfileError> {
    if !(1..=3600).contains(&secs) {
        return Err(ProfileError::new("lock_duration_secs", "must be within 1..=3600"));
    }
    Ok(())
}

/// Door half of a `config_updated` event.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoorConfigView {
    pub auto_unlock: bool,
    pub unlock_confidence: f32,
    pub log_confidence: f32,
    pub lock_duration_secs: u64,
}

/// Complete settings as published after any configuration change.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfigSnapshot {
    pub performance: PerformanceProfile,
    pub door: DoorConfigView,
}

/// Whole-record shared setting.
pub struct SharedSetting<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for SharedSetting<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T: Clone> SharedSetting<T> {
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(value);
        Self { tx: Arc::new(tx) }
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the record, returning the previous one.
    pub fn replace(&self, value: T) -> T {
        self.tx.send_replace(value)
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}
