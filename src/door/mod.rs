//! Door lock automation.
//!
//! `DoorAutomation` is the only owner of the lock actuator and of `DoorState`.
//!
//! States: `Locked` and `Unlocked(deadline)`.
//! - `unlock` (manual or automatic) moves to `Unlocked(now + duration)` and
//!   replaces any pending relock. Durations never stack.
//! - the relock task fires at the deadline and moves to `Locked`. Each unlock
//!   bumps a generation counter; a relock carrying an older generation is a no-op.
//! - `force_lock` moves to `Locked` immediately and cancels the pending relock.
//!
//! Every transition runs while holding one async mutex, so transitions are
//! serialized (FIFO) and never reentrant. The hardware is written first; the
//! state only changes once the write succeeded. Transitions run on their own
//! task and actuator writes on the blocking pool, so a caller that gives up
//! waiting never leaves a write applied without its state change.

mod actuator;

use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use actuator::{Actuator, ActuatorError, DryRunActuator, SysfsGpioActuator};

use crate::Name;

/// Delay before a failed relock is attempted again.
pub const DEFAULT_RELOCK_RETRY: Duration = Duration::from_secs(1);

const TRANSITION_CHANNEL_DEPTH: usize = 64;

/// Authoritative door state. `locked` is the source of truth; `deadline` is
/// scheduling metadata only.
#[derive(Clone, Debug, PartialEq)]
pub struct DoorState {
    pub locked: bool,
    pub deadline: Option<Instant>,
    pub lock_duration: Duration,
}

/// Status report for observers and request handlers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DoorStatus {
    pub is_unlocked: bool,
    pub lock_duration_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relock_in_ms: Option<u64>,
    pub actuator: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum UnlockTrigger {
    Manual,
    Automatic { identity: Name, confidence: f32 },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockTrigger {
    Manual,
    Relock,
    Shutdown,
}

/// Successful state transition notification.
#[derive(Clone, Debug, PartialEq)]
pub enum DoorTransition {
    Unlocked {
        trigger: UnlockTrigger,
        duration: Duration,
    },
    Locked {
        trigger: LockTrigger,
    },
}

/// Result of an automatic unlock request.
#[derive(Clone, Debug, PartialEq)]
pub enum AutoUnlock {
    Unlocked(DoorStatus),
    /// The door was already unlocked; nothing was actuated.
    Suppressed,
}

type SharedActuator = Arc<StdMutex<Box<dyn Actuator>>>;

struct DoorCore {
    actuator: SharedActuator,
    generation: u64,
    relock_task: Option<JoinHandle<()>>,
    lock_duration: Duration,
}

struct DoorInner {
    core: Mutex<DoorCore>,
    state_tx: watch::Sender<DoorState>,
    transitions: broadcast::Sender<DoorTransition>,
    actuator_name: String,
    relock_retry: Duration,
}

enum RelockOutcome {
    Locked,
    Stale,
    Failed,
}

/// Handle to the door state machine. Cheap to clone.
#[derive(Clone)]
pub struct DoorAutomation {
    inner: Arc<DoorInner>,
}

impl DoorAutomation {
    /// Take ownership of the actuator and drive it to the locked level.
    pub fn new(actuator: Box<dyn Actuator>, lock_duration: Duration) -> Result<Self, ActuatorError> {
        Self::with_relock_retry(actuator, lock_duration, DEFAULT_RELOCK_RETRY)
    }

    pub fn with_relock_retry(
        mut actuator: Box<dyn Actuator>,
        lock_duration: Duration,
        relock_retry: Duration,
    ) -> Result<Self, ActuatorError> {
        actuator.set_open(false)?;
        let actuator_name = actuator.describe();
        let (state_tx, _) = watch::channel(DoorState {
            locked: true,
            deadline: None,
            lock_duration,
        });
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_DEPTH);
        log::info!(
            "DoorAutomation: ready on {} (lock duration {}s)",
            actuator_name,
            lock_duration.as_secs()
        );
        Ok(Self {
            inner: Arc::new(DoorInner {
                core: Mutex::new(DoorCore {
                    actuator: Arc::new(StdMutex::new(actuator)),
                    generation: 0,
                    relock_task: None,
                    lock_duration,
                }),
                state_tx,
                transitions,
                actuator_name,
                relock_retry,
            }),
        })
    }

    /// Manual unlock. Replaces any pending relock.
    ///
    /// Fails with `DurationOutOfRange` before touching the relay when the
    /// deadline cannot be represented.
    pub async fn unlock(&self, duration: Option<Duration>) -> Result<DoorStatus, ActuatorError> {
        let door = self.clone();
        run_transition(tokio::spawn(async move {
            let mut core = door.inner.core.lock().await;
            door.unlock_locked(&mut core, duration, UnlockTrigger::Manual).await?;
            Ok(door.status())
        }))
        .await
    }

    /// Automatic unlock on behalf of a recognized identity. A no-op while the
    /// door is already unlocked.
    pub async fn auto_unlock(
        &self,
        identity: &str,
        confidence: f32,
    ) -> Result<AutoUnlock, ActuatorError> {
        let door = self.clone();
        let identity = identity.to_string();
        run_transition(tokio::spawn(async move {
            let mut core = door.inner.core.lock().await;
            if !door.is_locked() {
                log::debug!(
                    "DoorAutomation: auto unlock for {} suppressed (already unlocked)",
                    identity
                );
                return Ok(AutoUnlock::Suppressed);
            }
            let trigger = UnlockTrigger::Automatic {
                identity,
                confidence,
            };
            door.unlock_locked(&mut core, None, trigger).await?;
            Ok(AutoUnlock::Unlocked(door.status()))
        }))
        .await
    }

    /// Lock now, cancelling any pending relock.
    pub async fn force_lock(&self, trigger: LockTrigger) -> Result<DoorStatus, ActuatorError> {
        let door = self.clone();
        run_transition(tokio::spawn(async move {
            let mut core = door.inner.core.lock().await;
            if let Err(err) = actuate(&core.actuator, false).await {
                log::error!("DoorAutomation: lock failed: {}", err);
                return Err(err);
            }
            core.generation += 1;
            if let Some(task) = core.relock_task.take() {
                task.abort();
            }
            door.inner.state_tx.send_modify(|state| {
                state.locked = true;
                state.deadline = None;
            });
            log::info!("DoorAutomation: locked ({:?})", trigger);
            let _ = door.inner.transitions.send(DoorTransition::Locked { trigger });
            Ok(door.status())
        }))
        .await
    }

    /// Best-effort final lock.
    pub async fn shutdown(&self) {
        if let Err(err) = self.force_lock(LockTrigger::Shutdown).await {
            log::warn!("DoorAutomation: final lock on shutdown failed: {}", err);
        }
    }

    /// Default unlock duration for subsequent unlocks. A pending relock keeps
    /// its deadline.
    pub async fn set_lock_duration(&self, lock_duration: Duration) {
        let mut core = self.inner.core.lock().await;
        core.lock_duration = lock_duration;
        self.inner
            .state_tx
            .send_modify(|state| state.lock_duration = lock_duration);
    }

    pub fn is_locked(&self) -> bool {
        self.inner.state_tx.borrow().locked
    }

    pub fn state(&self) -> DoorState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn status(&self) -> DoorStatus {
        let state = self.inner.state_tx.borrow();
        let relock_in_ms = match (state.locked, state.deadline) {
            (false, Some(deadline)) => Some(
                deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        DoorStatus {
            is_unlocked: !state.locked,
            lock_duration_secs: state.lock_duration.as_secs(),
            relock_in_ms,
            actuator: self.inner.actuator_name.clone(),
        }
    }

    /// Subscribe to successful transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<DoorTransition> {
        self.inner.transitions.subscribe()
    }

    async fn unlock_locked(
        &self,
        core: &mut DoorCore,
        duration: Option<Duration>,
        trigger: UnlockTrigger,
    ) -> Result<(), ActuatorError> {
        let duration = duration.unwrap_or(core.lock_duration);
        let Some(deadline) = Instant::now().checked_add(duration) else {
            log::warn!("DoorAutomation: unlock for {:?} refused", duration);
            return Err(ActuatorError::DurationOutOfRange(duration));
        };
        if let Err(err) = actuate(&core.actuator, true).await {
            log::error!("DoorAutomation: unlock failed: {}", err);
            return Err(err);
        }

        core.generation += 1;
        if let Some(task) = core.relock_task.take() {
            task.abort();
        }
        core.relock_task = Some(tokio::spawn(relock_after(
            Arc::downgrade(&self.inner),
            core.generation,
            deadline,
        )));

        self.inner.state_tx.send_modify(|state| {
            state.locked = false;
            state.deadline = Some(deadline);
        });
        match &trigger {
            UnlockTrigger::Manual => {
                log::info!("DoorAutomation: unlocked manually for {}s", duration.as_secs())
            }
            UnlockTrigger::Automatic {
                identity,
                confidence,
            } => log::info!(
                "DoorAutomation: unlocked for {} ({:.1}%) for {}s",
                identity,
                confidence * 100.0,
                duration.as_secs()
            ),
        }
        let _ = self
            .inner
            .transitions
            .send(DoorTransition::Unlocked { trigger, duration });
        Ok(())
    }

    async fn relock(&self, generation: u64) -> RelockOutcome {
        let mut core = self.inner.core.lock().await;
        if core.generation != generation {
            return RelockOutcome::Stale;
        }
        if let Err(err) = actuate(&core.actuator, false).await {
            log::error!(
                "DoorAutomation: relock failed, retrying in {:?}: {}",
                self.inner.relock_retry,
                err
            );
            return RelockOutcome::Failed;
        }
        // this task's own handle; dropping it detaches
        core.relock_task = None;
        self.inner.state_tx.send_modify(|state| {
            state.locked = true;
            state.deadline = None;
        });
        log::info!("DoorAutomation: relocked");
        let _ = self.inner.transitions.send(DoorTransition::Locked {
            trigger: LockTrigger::Relock,
        });
        RelockOutcome::Locked
    }
}

/// Write the relay level on the blocking pool.
async fn actuate(actuator: &SharedActuator, open: bool) -> Result<(), ActuatorError> {
    let actuator = Arc::clone(actuator);
    tokio::task::spawn_blocking(move || {
        let mut actuator = actuator
            .lock()
            .map_err(|_| ActuatorError::Unavailable("actuator lock poisoned".into()))?;
        actuator.set_open(open)
    })
    .await
    .map_err(|err| ActuatorError::WriteFailed(format!("actuator task failed: {}", err)))?
}

async fn run_transition<T>(
    task: JoinHandle<Result<T, ActuatorError>>,
) -> Result<T, ActuatorError> {
    task.await
        .map_err(|err| ActuatorError::WriteFailed(format!("door transition failed: {}", err)))?
}

async fn relock_after(inner: Weak<DoorInner>, generation: u64, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    loop {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let retry = inner.relock_retry;
        let door = DoorAutomation { inner };
        match door.relock(generation).await {
            RelockOutcome::Locked | RelockOutcome::Stale => return,
            RelockOutcome::Failed => {
                drop(door);
                tokio::time::sleep(retry).await;
            }
        }
    }
}
