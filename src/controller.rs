//! Access controller: the operations exposed to a transport.
//!
//! Owns one of each component and wires them together:
//! - the stream supervisor (started/stopped by observer presence)
//! - a forwarder turning door transitions into `door_unlocked` / `door_locked`
//!   events
//!
//! A transport only ever talks to `AccessController`.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::detect::{GateSettings, IdentityStore, Matcher, RecognitionGate, UserSummary};
use crate::door::{
    Actuator, ActuatorError, DoorAutomation, DoorStatus, DoorTransition, LockTrigger,
    UnlockTrigger, DEFAULT_RELOCK_RETRY,
};
use crate::encode::{EncodedFrame, LoadAdaptiveEncoder, LoadSampler};
use crate::hub::{
    DoorLockedEvent, DoorUnlockedEvent, EventHub, HubConfig, Observer, ObserverId, ObserverStats,
    OutboundEvent,
};
use crate::ingest::FrameSource;
use crate::log::{RecognitionEntry, RecognitionLog, MAX_LOG_ENTRIES};
use crate::orchestrator::{
    OrchestratorConfig, SnapshotError, StreamOrchestrator, StreamParts, StreamState,
    StreamStatsSnapshot,
};
use crate::settings::{
    AccessPolicy, ConfigSnapshot, DoorConfigView, PerformanceProfile, PolicyUpdate, ProfileError,
    ProfileUpdate, SharedSetting,
};
use crate::worker::WorkerPool;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub lock_duration: Duration,
    pub relock_retry: Duration,
    pub performance: PerformanceProfile,
    pub policy: AccessPolicy,
    pub gate: GateSettings,
    pub hub: HubConfig,
    pub stream: OrchestratorConfig,
    pub worker_threads: usize,
    pub log_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(5),
            relock_retry: DEFAULT_RELOCK_RETRY,
            performance: PerformanceProfile::default(),
            policy: AccessPolicy::default(),
            gate: GateSettings::default(),
            hub: HubConfig::default(),
            stream: OrchestratorConfig::default(),
            worker_threads: 2,
            log_capacity: MAX_LOG_ENTRIES,
        }
    }
}

/// Collaborators supplied by the deployment.
pub struct ControllerParts {
    pub source: Box<dyn FrameSource>,
    pub matcher: Arc<dyn Matcher>,
    pub identities: Arc<dyn IdentityStore>,
    pub actuator: Box<dyn Actuator>,
    pub load_sampler: Box<dyn LoadSampler>,
}

struct Background {
    supervisor: JoinHandle<()>,
    forwarder: JoinHandle<()>,
    stop_forwarder: oneshot::Sender<()>,
}

pub struct AccessController {
    door: DoorAutomation,
    hub: Arc<EventHub>,
    stream: Arc<StreamOrchestrator>,
    identities: Arc<dyn IdentityStore>,
    profile: SharedSetting<PerformanceProfile>,
    policy: SharedSetting<AccessPolicy>,
    recognitions: Arc<RecognitionLog>,
    workers: WorkerPool,
    /// Serializes read-modify-write settings updates.
    settings_update: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    background: StdMutex<Option<Background>>,
}

impl AccessController {
    /// Build every component and spawn the background tasks. Must be called
    /// from within a tokio runtime.
    pub fn start(parts: ControllerParts, config: ControllerConfig) -> Result<Self> {
        config
            .performance
            .validate()
            .context("invalid performance profile")?;
        config.policy.validate().context("invalid access policy")?;

        let door = DoorAutomation::with_relock_retry(
            parts.actuator,
            config.lock_duration,
            config.relock_retry,
        )
        .context("drive door actuator to locked")?;

        let hub = Arc::new(EventHub::new(config.hub.clone()));
        let profile = SharedSetting::new(config.performance.clone());
        let policy = SharedSetting::new(config.policy.clone());
        let recognitions = Arc::new(RecognitionLog::with_capacity(config.log_capacity));
        let workers = WorkerPool::new(config.worker_threads);
        let gate = Arc::new(RecognitionGate::new(
            parts.matcher,
            Arc::clone(&parts.identities),
            config.gate.clone(),
        ));
        log::info!(
            "AccessController: matcher {}, {} enrolled identities, {} workers",
            gate.matcher_name(),
            parts.identities.all_names().len(),
            workers.size()
        );

        let stream = StreamOrchestrator::new(
            StreamParts {
                source: parts.source,
                gate,
                encoder: LoadAdaptiveEncoder::new(parts.load_sampler),
                door: door.clone(),
                hub: Arc::clone(&hub),
                profile: profile.clone(),
                policy: policy.clone(),
                recognitions: Arc::clone(&recognitions),
                workers: workers.clone(),
            },
            config.stream.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = stream.spawn(shutdown_rx)?;
        let (stop_forwarder, stop_rx) = oneshot::channel();
        let forwarder = tokio::spawn(forward_door_events(
            door.subscribe(),
            Arc::clone(&hub),
            stop_rx,
        ));

        Ok(Self {
            door,
            hub,
            stream,
            identities: parts.identities,
            profile,
            policy,
            recognitions,
            workers,
            settings_update: Mutex::new(()),
            shutdown_tx,
            background: StdMutex::new(Some(Background {
                supervisor,
                forwarder,
                stop_forwarder,
            })),
        })
    }

    pub async fn unlock_door(&self, duration: Option<Duration>) -> Result<DoorStatus, ActuatorError> {
        self.door.unlock(duration).await
    }

    pub async fn lock_door(&self) -> Result<DoorStatus, ActuatorError> {
        self.door.force_lock(LockTrigger::Manual).await
    }

    pub fn door_status(&self) -> DoorStatus {
        self.door.status()
    }

    pub fn door(&self) -> &DoorAutomation {
        &self.door
    }

    pub fn performance(&self) -> PerformanceProfile {
        self.profile.snapshot()
    }

    pub fn config_snapshot(&self) -> ConfigSnapshot {
        let policy = self.policy.snapshot();
        ConfigSnapshot {
            performance: self.profile.snapshot(),
            door: DoorConfigView {
                auto_unlock: policy.auto_unlock,
                unlock_confidence: policy.unlock_confidence,
                log_confidence: policy.log_confidence,
                lock_duration_secs: self.door.state().lock_duration.as_secs(),
            },
        }
    }

    /// Validate and apply a partial profile. The stream picks up the new
    /// record on its next iteration.
    pub async fn update_performance_settings(
        &self,
        update: &ProfileUpdate,
    ) -> Result<PerformanceProfile, ProfileError> {
        let _guard = self.settings_update.lock().await;
        let next = self.profile.snapshot().merged(update)?;
        self.profile.replace(next.clone());
        log::info!(
            "AccessController: performance settings updated (fps {}, interval {}, quality {})",
            next.target_fps,
            next.recognition_interval,
            next.jpeg_quality
        );
        self.announce_config().await;
        Ok(next)
    }

    pub async fn update_door_config(
        &self,
        update: &PolicyUpdate,
    ) -> Result<ConfigSnapshot, ProfileError> {
        let _guard = self.settings_update.lock().await;
        let next = update.merged(&self.policy.snapshot())?;
        if let Some(secs) = update.lock_duration_secs {
            self.door.set_lock_duration(Duration::from_secs(secs)).await;
        }
        self.policy.replace(next);
        log::info!("AccessController: door configuration updated");
        Ok(self.announce_config().await)
    }

    async fn announce_config(&self) -> ConfigSnapshot {
        let snapshot = self.config_snapshot();
        self.hub
            .publish(&OutboundEvent::ConfigUpdated(snapshot.clone()))
            .await;
        snapshot
    }

    /// Attach an observer. Its first event is the current door status.
    pub async fn attach_observer(&self, label: impl Into<String>) -> Observer {
        let greeting = OutboundEvent::DoorStatus(self.door.status());
        self.hub.attach(label, Some(&greeting)).await
    }

    pub async fn detach_observer(&self, id: ObserverId) -> bool {
        self.hub.detach(id).await
    }

    pub async fn capture_snapshot(&self) -> Result<EncodedFrame, SnapshotError> {
        self.stream.capture_snapshot().await
    }

    pub fn recent_recognitions(&self, limit: usize) -> Vec<RecognitionEntry> {
        self.recognitions.recent(limit)
    }

    pub fn list_users(&self) -> Vec<UserSummary> {
        self.identities
            .all_names()
            .into_iter()
            .map(|name| UserSummary {
                is_authorized: self.identities.is_authorized(&name),
                name,
            })
            .collect()
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream.state()
    }

    pub fn watch_stream_state(&self) -> watch::Receiver<StreamState> {
        self.stream.watch_state()
    }

    pub fn stream_stats(&self) -> StreamStatsSnapshot {
        self.stream.stats()
    }

    pub async fn observer_stats(&self) -> Vec<ObserverStats> {
        self.hub.observer_stats().await
    }

    /// Stop the stream (device released), then lock the door. Idempotent.
    pub async fn shutdown(&self) {
        let background = self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(background) = background else {
            return;
        };
        log::info!("AccessController: shutting down");

        self.shutdown_tx.send_replace(true);
        if let Err(err) = background.supervisor.await {
            log::error!("AccessController: stream supervisor failed: {}", err);
        }
        self.door.shutdown().await;
        let _ = background.stop_forwarder.send(());
        if let Err(err) = background.forwarder.await {
            log::error!("AccessController: door event forwarder failed: {}", err);
        }
        self.workers.close();
    }
}

/// Event announcing a door transition.
pub fn door_event(transition: &DoorTransition) -> OutboundEvent {
    match transition {
        DoorTransition::Unlocked { trigger, duration } => {
            let (user, confidence, auto_unlock) = match trigger {
                UnlockTrigger::Manual => ("manual".to_string(), None, false),
                UnlockTrigger::Automatic {
                    identity,
                    confidence,
                } => (identity.clone(), Some(*confidence), true),
            };
            OutboundEvent::DoorUnlocked(DoorUnlockedEvent {
                user,
                confidence,
                duration_secs: duration.as_secs(),
                auto_unlock,
            })
        }
        DoorTransition::Locked { trigger } => OutboundEvent::DoorLocked(DoorLockedEvent {
            manual: *trigger == LockTrigger::Manual,
            trigger: *trigger,
        }),
    }
}

async fn forward_door_events(
    mut transitions: broadcast::Receiver<DoorTransition>,
    hub: Arc<EventHub>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            received = transitions.recv() => match received {
                Ok(transition) => {
                    hub.publish(&door_event(&transition)).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("AccessController: {} door events dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_and_automatic_unlock_events() {
        let manual = door_event(&DoorTransition::Unlocked {
            trigger: UnlockTrigger::Manual,
            duration: Duration::from_secs(5),
        });
        assert_eq!(
            manual,
            OutboundEvent::DoorUnlocked(DoorUnlockedEvent {
                user: "manual".into(),
                confidence: None,
                duration_secs: 5,
                auto_unlock: false,
            })
        );

        let automatic = door_event(&DoorTransition::Unlocked {
            trigger: UnlockTrigger::Automatic {
                identity: "alice".into(),
                confidence: 0.9,
            },
            duration: Duration::from_secs(8),
        });
        match automatic {
            OutboundEvent::DoorUnlocked(event) => {
                assert_eq!(event.user, "alice");
                assert_eq!(event.confidence, Some(0.9));
                assert!(event.auto_unlock);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn relock_is_not_manual() {
        let relock = door_event(&DoorTransition::Locked {
            trigger: LockTrigger::Relock,
        });
        assert_eq!(relock.kind(), "door_locked");
        assert_eq!(
            relock,
            OutboundEvent::DoorLocked(DoorLockedEvent {
                manual: false,
                trigger: LockTrigger::Relock,
            })
        );
    }
}
