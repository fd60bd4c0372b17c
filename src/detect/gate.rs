//! Recognition gate.
//!
//! Decides which frames are recognized and turns matcher output into
//! `Detection`s.
//!
//! Frame `i` is recognized iff `i % recognition_interval == 0`, or when a
//! caller forced recognition of the next frame (snapshot capture). Skipping is
//! deterministic; it never depends on how busy the system is.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::backend::{Matcher, MatcherError};
use super::identity::IdentityStore;
use crate::door::{ActuatorError, AutoUnlock, DoorAutomation};
use crate::frame::Frame;
use crate::settings::AccessPolicy;
use crate::{Detection, Name};

#[derive(Clone, Debug, PartialEq)]
pub struct GateSettings {
    /// Maximum embedding distance accepted as a match.
    pub match_tolerance: f32,
    /// Integer downscale applied before locating faces.
    pub downscale: u32,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            match_tolerance: 0.4,
            downscale: 4,
        }
    }
}

/// Result of driving the door from one recognized frame.
#[derive(Clone, Debug, PartialEq)]
pub enum UnlockAttempt {
    Unlocked { identity: Name },
    /// An eligible face was seen but the door was already unlocked.
    Suppressed,
    Failed(ActuatorError),
}

/// True when `index` is a scheduled recognition frame.
pub fn is_scheduled(index: u64, interval: u32) -> bool {
    index % u64::from(interval.max(1)) == 0
}

/// Auto-unlock eligibility: authorized identity at or above `unlock_confidence`
/// with auto-unlock enabled.
pub fn unlock_eligible(detection: &Detection, policy: &AccessPolicy) -> bool {
    policy.auto_unlock
        && detection.is_known()
        && detection.authorized
        && detection.confidence >= policy.unlock_confidence
}

/// Whether an identified face is reported and logged. Independent of
/// authorization and of unlock eligibility.
pub fn loggable(detection: &Detection, policy: &AccessPolicy) -> bool {
    detection.is_known() && detection.confidence >= policy.log_confidence
}

pub struct RecognitionGate {
    matcher: Arc<dyn Matcher>,
    identities: Arc<dyn IdentityStore>,
    settings: GateSettings,
    forced: AtomicBool,
    consecutive_failures: AtomicU64,
    total_failures: AtomicU64,
}

impl RecognitionGate {
    pub fn new(
        matcher: Arc<dyn Matcher>,
        identities: Arc<dyn IdentityStore>,
        settings: GateSettings,
    ) -> Self {
        Self {
            matcher,
            identities,
            settings,
            forced: AtomicBool::new(false),
            consecutive_failures: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    pub fn matcher_name(&self) -> &'static str {
        self.matcher.name()
    }

    pub fn identities(&self) -> &Arc<dyn IdentityStore> {
        &self.identities
    }

    /// Force recognition of the next frame regardless of the interval.
    pub fn request_forced(&self) {
        self.forced.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending forced request.
    pub fn should_recognize(&self, index: u64, interval: u32) -> bool {
        let forced = self.forced.swap(false, Ordering::SeqCst);
        forced || is_scheduled(index, interval)
    }

    /// Run the matcher on one frame. Blocking; call from a worker.
    pub fn recognize(&self, frame: &Frame) -> Result<Vec<Detection>, MatcherError> {
        match self.run_matcher(frame) {
            Ok(detections) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                Ok(detections)
            }
            Err(err) => {
                let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "RecognitionGate: {} failed ({} consecutive): {}",
                    self.matcher.name(),
                    consecutive,
                    err
                );
                Err(err)
            }
        }
    }

    /// `(consecutive, total)` matcher failures.
    pub fn failure_counts(&self) -> (u64, u64) {
        (
            self.consecutive_failures.load(Ordering::Relaxed),
            self.total_failures.load(Ordering::Relaxed),
        )
    }

    fn run_matcher(&self, frame: &Frame) -> Result<Vec<Detection>, MatcherError> {
        let factor = self.settings.downscale.max(1);
        let small = frame.downscaled(factor);

        let boxes = self.matcher.locate(&small)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }
        let embeddings = self.matcher.embed(&small, &boxes)?;
        if embeddings.len() != boxes.len() {
            return Err(MatcherError::InvalidInput(format!(
                "{} embeddings for {} faces",
                embeddings.len(),
                boxes.len()
            )));
        }

        let known = self.identities.known_faces();
        let mut detections = Vec::with_capacity(boxes.len());
        for (bbox, embedding) in boxes.iter().zip(&embeddings) {
            let location = bbox.scaled(factor).clamped(frame.width, frame.height);
            let nearest = self.matcher.best_match(embedding, &known.embeddings)?;
            let detection = match nearest {
                Some((index, distance)) if distance <= self.settings.match_tolerance => {
                    match known.names.get(index) {
                        Some(name) => Detection::identified(
                            name.clone(),
                            1.0 - distance,
                            self.identities.is_authorized(name),
                            location,
                        ),
                        None => Detection::unknown(location),
                    }
                }
                _ => Detection::unknown(location),
            };
            detections.push(detection);
        }
        Ok(detections)
    }

    /// Request an automatic unlock for the first unlock-eligible detection.
    ///
    /// Only call with detections of a frame that was actually recognized.
    /// Returns `None` when no detection is eligible.
    pub async fn drive_unlock(
        &self,
        detections: &[Detection],
        policy: &AccessPolicy,
        door: &DoorAutomation,
    ) -> Option<UnlockAttempt> {
        let candidate = detections.iter().find(|d| unlock_eligible(d, policy))?;
        let identity = candidate.identity.as_deref()?;
        if !door.is_locked() {
            return Some(UnlockAttempt::Suppressed);
        }
        match door.auto_unlock(identity, candidate.confidence).await {
            Ok(AutoUnlock::Unlocked(_)) => Some(UnlockAttempt::Unlocked {
                identity: identity.to_string(),
            }),
            Ok(AutoUnlock::Suppressed) => Some(UnlockAttempt::Suppressed),
            Err(err) => Some(UnlockAttempt::Failed(err)),
        }
    }
}
