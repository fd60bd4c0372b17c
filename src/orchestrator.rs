//! Stream orchestrator.
//!
//! Lifecycle: `Idle -> Running -> Idle`.
//!
//! The supervisor task waits until the hub has at least one observer, then
//! runs a capture session until the observer count drops to zero (or shutdown
//! is requested). The session future is dropped at that point, which abandons
//! any in-flight recognition or encode job, and the capture device is closed
//! exactly once. The door relock timer lives in `DoorAutomation` and is not
//! affected.
//!
//! One session iteration:
//! 1. pace (frame interval, or unthrottled)
//! 2. capture on a worker; failures follow `CapturePolicy` without leaving the loop
//! 3. recognize on a worker when the gate selects the frame
//! 4. drive the door from that frame's detections, emit recognition events
//! 5. choose quality from system load and encode on a worker
//! 6. publish the `frame` event
//! 7. serve pending snapshot requests, advance the frame index

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::detect::{loggable, RecognitionGate, UnlockAttempt};
use crate::door::DoorAutomation;
use crate::encode::{self, EncodeError, EncodedFrame, LoadAdaptiveEncoder, SNAPSHOT_QUALITY};
use crate::frame::Frame;
use crate::hub::{EventHub, FrameEvent, OutboundEvent};
use crate::ingest::{CapturePolicy, CaptureRecovery, DeviceError, FrameSource, RecoveryAction};
use crate::log::{RecognitionEntry, RecognitionLog};
use crate::settings::{AccessPolicy, Pacing, PerformanceProfile, SharedSetting};
use crate::worker::{WorkerError, WorkerPool};
use crate::{now_epoch_ms, Detection, Name};

/// How long a snapshot request waits for the running loop before falling
/// back to a direct capture.
const SNAPSHOT_WAIT: Duration = Duration::from_secs(3);
const SNAPSHOT_QUEUE_DEPTH: usize = 4;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Running,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorConfig {
    pub capture: CapturePolicy,
    /// Period of the FPS log line.
    pub stats_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capture: CapturePolicy::default(),
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Snapshot capture failure.
#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotError {
    Device(DeviceError),
    Encode(EncodeError),
    Worker(WorkerError),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::Device(err) => write!(f, "snapshot capture failed: {}", err),
            SnapshotError::Encode(err) => write!(f, "snapshot encode failed: {}", err),
            SnapshotError::Worker(err) => write!(f, "snapshot worker failed: {}", err),
        }
    }
}

impl std::error::Error for SnapshotError {}

type SnapshotReply = oneshot::Sender<Result<EncodedFrame, SnapshotError>>;

/// Cumulative stream counters.
#[derive(Debug, Default)]
pub struct StreamStats {
    frames: AtomicU64,
    recognitions: AtomicU64,
    matcher_failures: AtomicU64,
    device_failures: AtomicU64,
    encode_failures: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    sessions: AtomicU64,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct StreamStatsSnapshot {
    pub frames: u64,
    pub recognitions: u64,
    pub matcher_failures: u64,
    pub device_failures: u64,
    pub encode_failures: u64,
    pub opens: u64,
    pub closes: u64,
    pub sessions: u64,
}

impl StreamStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            recognitions: self.recognitions.load(Ordering::Relaxed),
            matcher_failures: self.matcher_failures.load(Ordering::Relaxed),
            device_failures: self.device_failures.load(Ordering::Relaxed),
            encode_failures: self.encode_failures.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }
}

/// Everything a stream needs, handed over at construction.
pub struct StreamParts {
    pub source: Box<dyn FrameSource>,
    pub gate: Arc<RecognitionGate>,
    pub encoder: LoadAdaptiveEncoder,
    pub door: DoorAutomation,
    pub hub: Arc<EventHub>,
    pub profile: SharedSetting<PerformanceProfile>,
    pub policy: SharedSetting<AccessPolicy>,
    pub recognitions: Arc<RecognitionLog>,
    pub workers: WorkerPool,
}

pub struct StreamOrchestrator {
    source: Arc<StdMutex<Box<dyn FrameSource>>>,
    gate: Arc<RecognitionGate>,
    encoder: Arc<StdMutex<LoadAdaptiveEncoder>>,
    door: DoorAutomation,
    hub: Arc<EventHub>,
    profile: SharedSetting<PerformanceProfile>,
    policy: SharedSetting<AccessPolicy>,
    recognitions: Arc<RecognitionLog>,
    workers: WorkerPool,
    config: OrchestratorConfig,
    state_tx: watch::Sender<StreamState>,
    stats: Arc<StreamStats>,
    /// Id of the running session, 0 while idle. Changed under the source lock
    /// on release, so a capture job left over from a finished session never
    /// reopens the device.
    active_session: Arc<AtomicU64>,
    snapshot_tx: mpsc::Sender<SnapshotReply>,
    snapshot_rx: StdMutex<Option<mpsc::Receiver<SnapshotReply>>>,
}

impl StreamOrchestrator {
    pub fn new(parts: StreamParts, config: OrchestratorConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(StreamState::Idle);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_QUEUE_DEPTH);
        Arc::new(Self {
            source: Arc::new(StdMutex::new(parts.source)),
            gate: parts.gate,
            encoder: Arc::new(StdMutex::new(parts.encoder)),
            door: parts.door,
            hub: parts.hub,
            profile: parts.profile,
            policy: parts.policy,
            recognitions: parts.recognitions,
            workers: parts.workers,
            config,
            state_tx,
            stats: Arc::new(StreamStats::default()),
            active_session: Arc::new(AtomicU64::new(0)),
            snapshot_tx,
            snapshot_rx: StdMutex::new(Some(snapshot_rx)),
        })
    }

    /// Start the supervisor. It exits once `shutdown` becomes true (or its
    /// sender is dropped), leaving the device closed.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let snapshots = self
            .snapshot_rx
            .lock()
            .map_err(|_| anyhow!("snapshot queue lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("stream supervisor already started"))?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            this.supervise(snapshots, shutdown).await;
        }))
    }

    pub fn state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// JPEG of the next frame (quality 85, no annotations).
    ///
    /// While streaming, the running loop serves the request and recognizes that
    /// frame. While idle, the device is opened, read once and closed again.
    pub async fn capture_snapshot(&self) -> Result<EncodedFrame, SnapshotError> {
        if self.state() == StreamState::Running {
            let (tx, rx) = oneshot::channel();
            if self.snapshot_tx.send(tx).await.is_ok() {
                match tokio::time::timeout(SNAPSHOT_WAIT, rx).await {
                    Ok(Ok(result)) => return result,
                    Ok(Err(_)) => log::debug!("StreamOrchestrator: stream stopped before snapshot"),
                    Err(_) => log::warn!("StreamOrchestrator: snapshot not served in time"),
                }
            }
        }
        self.capture_direct_snapshot().await
    }

    async fn capture_direct_snapshot(&self) -> Result<EncodedFrame, SnapshotError> {
        let source = Arc::clone(&self.source);
        let stats = Arc::clone(&self.stats);
        self.workers
            .run(move || {
                let mut source = source.lock().unwrap_or_else(|e| e.into_inner());
                let was_open = source.is_open();
                if !was_open {
                    source.open().map_err(SnapshotError::Device)?;
                    StreamStats::bump(&stats.opens);
                }
                let frame = source.next_frame();
                if !was_open {
                    source.close();
                    StreamStats::bump(&stats.closes);
                }
                let frame = frame.map_err(SnapshotError::Device)?;
                encode::encode(&frame, SNAPSHOT_QUALITY, &[]).map_err(SnapshotError::Encode)
            })
            .await
            .map_err(SnapshotError::Worker)?
    }

    async fn supervise(
        self: Arc<Self>,
        mut snapshots: mpsc::Receiver<SnapshotReply>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut observers = self.hub.watch_observers();
        loop {
            tokio::select! {
                attached = observers.wait_for(|count| *count > 0) => {
                    if attached.is_err() {
                        break;
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }

            let session = self.stats.sessions.fetch_add(1, Ordering::Relaxed) + 1;
            self.active_session.store(session, Ordering::SeqCst);
            self.state_tx.send_replace(StreamState::Running);
            log::info!("StreamOrchestrator: observer attached, starting stream");

            let reason = tokio::select! {
                _ = self.run_session(session, &mut snapshots) => "session ended",
                _ = observers.wait_for(|count| *count == 0) => "last observer detached",
                _ = shutdown.wait_for(|stop| *stop) => "shutdown",
            };

            self.release_device().await;
            // dropped replies make waiting callers fall back to a direct capture
            while snapshots.try_recv().is_ok() {}
            self.state_tx.send_replace(StreamState::Idle);
            log::info!("StreamOrchestrator: stream stopped ({})", reason);

            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }
        }
        log::info!("StreamOrchestrator: supervisor exiting");
    }

    async fn release_device(&self) {
        let source = Arc::clone(&self.source);
        let stats = Arc::clone(&self.stats);
        let active = Arc::clone(&self.active_session);
        let released = tokio::task::spawn_blocking(move || {
            let mut source = source.lock().unwrap_or_else(|e| e.into_inner());
            active.store(0, Ordering::SeqCst);
            source.close();
            StreamStats::bump(&stats.closes);
            source.describe()
        })
        .await;
        match released {
            Ok(device) => log::info!("StreamOrchestrator: released {}", device),
            Err(err) => log::error!("StreamOrchestrator: device release failed: {}", err),
        }
    }

    async fn run_session(&self, session: u64, snapshots: &mut mpsc::Receiver<SnapshotReply>) {
        let mut recovery = CaptureRecovery::new(self.config.capture.clone());
        let mut index: u64 = 0;
        let mut last_capture: Option<Instant> = None;
        let mut window_start = Instant::now();
        let mut window_frames: u64 = 0;

        loop {
            let profile = self.profile.snapshot();

            match profile.pacing {
                Pacing::FrameInterval => {
                    if let Some(last) = last_capture {
                        tokio::time::sleep_until(last + profile.frame_interval()).await;
                    }
                }
                Pacing::Unthrottled => tokio::task::yield_now().await,
            }

            let attempt = Instant::now();
            let frame = match self.capture(profile.max_frame_width, session).await {
                Ok((frame, opened)) => {
                    if opened {
                        recovery.on_open();
                    }
                    recovery.on_frame();
                    last_capture = Some(frame.captured_at());
                    frame
                }
                Err(failure) => {
                    last_capture = Some(attempt);
                    self.recover(&mut recovery, failure).await;
                    continue;
                }
            };
            let frame = Arc::new(frame);

            let mut pending: Vec<SnapshotReply> = Vec::new();
            while let Ok(reply) = snapshots.try_recv() {
                pending.push(reply);
            }
            if !pending.is_empty() {
                self.gate.request_forced();
            }

            let recognized = self.gate.should_recognize(index, profile.recognition_interval);
            let detections = if recognized {
                self.recognize(&frame).await
            } else {
                Vec::new()
            };

            if recognized {
                let policy = self.policy.snapshot();
                let unlocked_by = match self.gate.drive_unlock(&detections, &policy, &self.door).await {
                    Some(UnlockAttempt::Unlocked { identity }) => Some(identity),
                    Some(UnlockAttempt::Failed(err)) => {
                        log::warn!("StreamOrchestrator: automatic unlock failed: {}", err);
                        None
                    }
                    Some(UnlockAttempt::Suppressed) | None => None,
                };
                self.report_recognitions(&detections, &policy, unlocked_by).await;
            }

            match self.encode(&frame, &profile, &detections).await {
                Ok(encoded) => {
                    let event = OutboundEvent::Frame(FrameEvent {
                        image: STANDARD.encode(&encoded.bytes),
                        detections,
                        door_status: self.door.status(),
                        frame_index: index,
                        quality: encoded.quality,
                        width: encoded.width,
                        height: encoded.height,
                    });
                    self.hub.publish(&event).await;
                }
                Err(err) => {
                    StreamStats::bump(&self.stats.encode_failures);
                    log::warn!("StreamOrchestrator: frame {} not published: {}", index, err);
                }
            }

            if !pending.is_empty() {
                self.serve_snapshots(&frame, pending).await;
            }

            StreamStats::bump(&self.stats.frames);
            index += 1;
            window_frames += 1;
            let elapsed = window_start.elapsed();
            if elapsed >= self.config.stats_interval {
                log::info!(
                    "StreamOrchestrator: {:.1} fps over {:.1}s, {} observers",
                    window_frames as f64 / elapsed.as_secs_f64(),
                    elapsed.as_secs_f64(),
                    self.hub.observer_count().await
                );
                window_start = Instant::now();
                window_frames = 0;
            }
        }
    }

    /// Read one frame, opening the device first when needed. The flag tells
    /// whether this call opened it. Jobs of a session that is no longer
    /// active leave the device alone.
    async fn capture(&self, max_width: u32, session: u64) -> Result<(Frame, bool), CaptureFailure> {
        let source = Arc::clone(&self.source);
        let stats = Arc::clone(&self.stats);
        let active = Arc::clone(&self.active_session);
        self.workers
            .run(move || {
                let mut source = source.lock().unwrap_or_else(|e| e.into_inner());
                if active.load(Ordering::SeqCst) != session {
                    return Err(CaptureFailure::Stopped);
                }
                let opened = if source.is_open() {
                    false
                } else {
                    source.open().map_err(CaptureFailure::Open)?;
                    StreamStats::bump(&stats.opens);
                    log::info!("StreamOrchestrator: opened {}", source.describe());
                    true
                };
                source
                    .next_frame()
                    .map(|frame| (frame.fit_width(max_width), opened))
                    .map_err(|err| CaptureFailure::Read { err, opened })
            })
            .await
            .map_err(CaptureFailure::Worker)?
    }

    async fn recover(&self, recovery: &mut CaptureRecovery, failure: CaptureFailure) {
        match failure {
            CaptureFailure::Open(err) => {
                StreamStats::bump(&self.stats.device_failures);
                let backoff = recovery.on_open_failure();
                log::warn!("StreamOrchestrator: {}; retrying in {:?}", err, backoff);
                tokio::time::sleep(backoff).await;
            }
            CaptureFailure::Read { err, opened } => {
                StreamStats::bump(&self.stats.device_failures);
                if opened {
                    recovery.on_open();
                }
                let action = match err {
                    DeviceError::Unavailable(_) => RecoveryAction::Reopen {
                        backoff: self.config.capture.reopen_backoff,
                    },
                    DeviceError::ReadFailed(_) => recovery.on_read_failure(),
                };
                match action {
                    RecoveryAction::RetryRead => {
                        log::debug!("StreamOrchestrator: {}; reading again", err);
                    }
                    RecoveryAction::Reopen { backoff } => {
                        log::warn!("StreamOrchestrator: {}; reopening in {:?}", err, backoff);
                        self.close_for_reopen().await;
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
            CaptureFailure::Worker(err) => {
                log::error!("StreamOrchestrator: capture worker failed: {}", err);
                tokio::time::sleep(self.config.capture.reopen_backoff).await;
            }
            CaptureFailure::Stopped => {
                log::debug!("StreamOrchestrator: capture skipped, session ended");
            }
        }
    }

    async fn close_for_reopen(&self) {
        let source = Arc::clone(&self.source);
        let closed = tokio::task::spawn_blocking(move || {
            let mut source = source.lock().unwrap_or_else(|e| e.into_inner());
            source.close();
        })
        .await;
        if let Err(err) = closed {
            log::error!("StreamOrchestrator: device close failed: {}", err);
        }
    }

    async fn recognize(&self, frame: &Arc<Frame>) -> Vec<Detection> {
        StreamStats::bump(&self.stats.recognitions);
        let gate = Arc::clone(&self.gate);
        let frame = Arc::clone(frame);
        match self.workers.run(move || gate.recognize(&frame)).await {
            Ok(Ok(detections)) => detections,
            // logged by the gate
            Ok(Err(_)) => {
                StreamStats::bump(&self.stats.matcher_failures);
                Vec::new()
            }
            Err(err) => {
                StreamStats::bump(&self.stats.matcher_failures);
                log::error!("StreamOrchestrator: recognition worker failed: {}", err);
                Vec::new()
            }
        }
    }

    async fn report_recognitions(
        &self,
        detections: &[Detection],
        policy: &AccessPolicy,
        mut unlocked_by: Option<Name>,
    ) {
        for detection in detections.iter().filter(|d| loggable(d, policy)) {
            let Some(name) = detection.identity.clone() else {
                continue;
            };
            let door_unlocked = unlocked_by.as_deref() == Some(name.as_str());
            if door_unlocked {
                unlocked_by = None;
            }
            let entry = RecognitionEntry {
                timestamp_ms: now_epoch_ms(),
                name,
                confidence: detection.confidence,
                is_authorized: detection.authorized,
                door_unlocked,
            };
            log::info!(
                "StreamOrchestrator: recognized {} ({:.1}%, authorized: {})",
                entry.name,
                entry.confidence * 100.0,
                entry.is_authorized
            );
            self.recognitions.record(entry.clone());
            self.hub.publish(&OutboundEvent::Recognition(entry)).await;
        }
    }

    async fn encode(
        &self,
        frame: &Arc<Frame>,
        profile: &PerformanceProfile,
        detections: &[Detection],
    ) -> Result<EncodedFrame, String> {
        let encoder = Arc::clone(&self.encoder);
        let frame = Arc::clone(frame);
        let profile = profile.clone();
        let detections = detections.to_vec();
        match self
            .workers
            .run(move || {
                let quality = encoder
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .quality_for(&profile);
                encode::encode(&frame, quality, &detections)
            })
            .await
        {
            Ok(Ok(encoded)) => Ok(encoded),
            Ok(Err(err)) => Err(err.to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    async fn serve_snapshots(&self, frame: &Arc<Frame>, pending: Vec<SnapshotReply>) {
        let snapshot_frame = Arc::clone(frame);
        let result = self
            .workers
            .run(move || encode::encode(&snapshot_frame, SNAPSHOT_QUALITY, &[]))
            .await
            .map_err(SnapshotError::Worker)
            .and_then(|encoded| encoded.map_err(SnapshotError::Encode));
        for reply in pending {
            let _ = reply.send(result.clone());
        }
    }
}

#[derive(Debug)]
enum CaptureFailure {
    Open(DeviceError),
    Read { err: DeviceError, opened: bool },
    Worker(WorkerError),
    /// The session this capture belonged to has been released.
    Stopped,
}
