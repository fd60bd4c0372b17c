use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use facegate::detect::{Embedding, InMemoryIdentityStore, Matcher, MatcherError};
use facegate::door::{Actuator, ActuatorError};
use facegate::encode::FixedLoad;
use facegate::hub::HubConfig;
use facegate::ingest::{CapturePolicy, DeviceError, FrameSource};
use facegate::orchestrator::{OrchestratorConfig, StreamState};
use facegate::settings::{Pacing, PerformanceProfile, ProfileUpdate};
use facegate::{
    AccessController, BoundingBox, ControllerConfig, ControllerParts, Frame, SystemLoad,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct SourceCounters {
    opens: Arc<AtomicU64>,
    closes: Arc<AtomicU64>,
    reads: Arc<AtomicU64>,
}

/// In-memory camera. The first `failing_reads` reads fail, and once
/// `frame_budget` frames were delivered every further read fails.
struct ScriptedSource {
    counters: SourceCounters,
    failing_reads: u64,
    frame_budget: Option<u64>,
    open: bool,
}

impl FrameSource for ScriptedSource {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.open = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, DeviceError> {
        if !self.open {
            return Err(DeviceError::Unavailable("not open".into()));
        }
        let read = self.counters.reads.fetch_add(1, Ordering::SeqCst);
        if read < self.failing_reads {
            return Err(DeviceError::ReadFailed("scripted failure".into()));
        }
        if let Some(budget) = self.frame_budget {
            if read >= self.failing_reads + budget {
                return Err(DeviceError::ReadFailed("frame budget spent".into()));
            }
        }
        Ok(Frame::filled(64, 48, [90, 90, 90]))
    }

    fn close(&mut self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Finds one face per frame and embeds it as `embedding`; counts calls.
struct CountingMatcher {
    embedding: Embedding,
    calls: Arc<AtomicU64>,
    fail: bool,
}

impl Matcher for CountingMatcher {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn locate(&self, _frame: &Frame) -> Result<Vec<BoundingBox>, MatcherError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MatcherError::Backend("scripted failure".into()));
        }
        Ok(vec![BoundingBox::new(2, 10, 8, 3)])
    }

    fn embed(&self, _frame: &Frame, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, MatcherError> {
        Ok(boxes.iter().map(|_| self.embedding.clone()).collect())
    }
}

struct RecordingActuator {
    writes: Arc<Mutex<Vec<bool>>>,
}

impl Actuator for RecordingActuator {
    fn set_open(&mut self, open: bool) -> Result<(), ActuatorError> {
        self.writes.lock().unwrap().push(open);
        Ok(())
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

struct Harness {
    controller: AccessController,
    source: SourceCounters,
    matcher_calls: Arc<AtomicU64>,
    writes: Arc<Mutex<Vec<bool>>>,
}

struct HarnessOptions {
    recognition_interval: u32,
    failing_reads: u64,
    frame_budget: Option<u64>,
    matcher_fails: bool,
    embedding: Embedding,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            recognition_interval: 1,
            failing_reads: 0,
            frame_budget: None,
            matcher_fails: false,
            // alice's enrolled embedding
            embedding: vec![0.0, 0.0],
        }
    }
}

fn start(options: HarnessOptions) -> Harness {
    let source = SourceCounters::default();
    let matcher_calls = Arc::new(AtomicU64::new(0));
    let writes = Arc::new(Mutex::new(Vec::new()));

    let identities = InMemoryIdentityStore::new();
    identities.enroll("alice", vec![0.0, 0.0], true);
    identities.enroll("bob", vec![5.0, 5.0], false);

    let parts = ControllerParts {
        source: Box::new(ScriptedSource {
            counters: source.clone(),
            failing_reads: options.failing_reads,
            frame_budget: options.frame_budget,
            open: false,
        }),
        matcher: Arc::new(CountingMatcher {
            embedding: options.embedding,
            calls: Arc::clone(&matcher_calls),
            fail: options.matcher_fails,
        }),
        identities: Arc::new(identities),
        actuator: Box::new(RecordingActuator {
            writes: Arc::clone(&writes),
        }),
        load_sampler: Box::new(FixedLoad(SystemLoad::default())),
    };
    let config = ControllerConfig {
        lock_duration: Duration::from_secs(60),
        performance: PerformanceProfile {
            recognition_interval: options.recognition_interval,
            pacing: Pacing::Unthrottled,
            ..PerformanceProfile::default()
        },
        hub: HubConfig {
            queue_depth: 64,
            send_timeout: Duration::from_secs(2),
        },
        stream: OrchestratorConfig {
            capture: CapturePolicy {
                read_retries: 1,
                reopen_backoff: Duration::from_millis(5),
                max_reopen_attempts: 3,
                long_backoff: Duration::from_millis(20),
            },
            stats_interval: Duration::from_secs(60),
        },
        ..ControllerConfig::default()
    };
    let controller = AccessController::start(parts, config).expect("controller starts");
    Harness {
        controller,
        source,
        matcher_calls,
        writes,
    }
}

async fn next_event(rx: &mut mpsc::Receiver<Arc<str>>, kind: &str) -> Value {
    loop {
        let message = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("event within timeout")
            .expect("observer still attached");
        let value: Value = serde_json::from_str(&message).expect("valid envelope");
        if value["type"] == kind {
            return value;
        }
    }
}

async fn wait_for_state(controller: &AccessController, state: StreamState) {
    let mut states = controller.watch_stream_state();
    tokio::time::timeout(WAIT, states.wait_for(|s| *s == state))
        .await
        .expect("state reached in time")
        .expect("stream supervisor alive");
}

#[tokio::test]
async fn recognition_runs_only_on_interval_frames() {
    const FRAMES: u64 = 22;
    let harness = start(HarnessOptions {
        recognition_interval: 5,
        frame_budget: Some(FRAMES),
        ..HarnessOptions::default()
    });
    let mut observer = harness.controller.attach_observer("viewer").await;

    for expected_index in 0..FRAMES {
        let frame = next_event(&mut observer.rx, "frame").await;
        let data = &frame["data"];
        assert_eq!(data["frame_index"], expected_index);
        let detections = data["detections"].as_array().expect("detections array");
        if expected_index % 5 == 0 {
            assert_eq!(detections.len(), 1, "frame {} is recognized", expected_index);
            assert_eq!(detections[0]["name"], "alice");
        } else {
            assert!(detections.is_empty(), "frame {} is skipped", expected_index);
        }
    }

    // the source is spent; the loop only retries reads from here on
    tokio::time::timeout(WAIT, async {
        while harness.controller.stream_stats().frames < FRAMES {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all frames counted");
    harness.controller.detach_observer(observer.id).await;
    wait_for_state(&harness.controller, StreamState::Idle).await;

    let stats = harness.controller.stream_stats();
    let expected = FRAMES.div_ceil(5);
    assert_eq!(stats.frames, FRAMES);
    assert_eq!(stats.recognitions, expected);
    assert_eq!(harness.matcher_calls.load(Ordering::SeqCst), expected);
    harness.controller.shutdown().await;
}

#[tokio::test]
async fn authorized_face_unlocks_once_while_unlocked() {
    let harness = start(HarnessOptions::default());
    let mut observer = harness.controller.attach_observer("viewer").await;

    // every frame recognizes alice
    let unlocked = next_event(&mut observer.rx, "door_unlocked").await;
    assert_eq!(unlocked["data"]["user"], "alice");
    assert_eq!(unlocked["data"]["auto_unlock"], true);
    assert_eq!(unlocked["data"]["duration_secs"], 60);
    for _ in 0..10 {
        next_event(&mut observer.rx, "frame").await;
    }

    harness.controller.detach_observer(observer.id).await;
    wait_for_state(&harness.controller, StreamState::Idle).await;

    // locked at construction, then exactly one unlock
    assert_eq!(*harness.writes.lock().unwrap(), vec![false, true]);
    assert!(harness.controller.door_status().is_unlocked);

    let log = harness.controller.recent_recognitions(100);
    assert!(log.len() >= 10);
    assert_eq!(log.iter().filter(|entry| entry.door_unlocked).count(), 1);
    assert!(log[0].door_unlocked);
    assert!(log.iter().all(|entry| entry.name == "alice" && entry.is_authorized));

    harness.controller.shutdown().await;
    assert_eq!(*harness.writes.lock().unwrap(), vec![false, true, false]);
}

#[tokio::test]
async fn unauthorized_face_is_logged_but_never_unlocks() {
    let harness = start(HarnessOptions {
        embedding: vec![5.0, 5.1],
        ..HarnessOptions::default()
    });
    let mut observer = harness.controller.attach_observer("viewer").await;

    let recognition = next_event(&mut observer.rx, "recognition").await;
    assert_eq!(recognition["data"]["name"], "bob");
    assert_eq!(recognition["data"]["is_authorized"], false);
    assert_eq!(recognition["data"]["door_unlocked"], false);
    for _ in 0..5 {
        next_event(&mut observer.rx, "frame").await;
    }

    harness.controller.detach_observer(observer.id).await;
    wait_for_state(&harness.controller, StreamState::Idle).await;
    assert_eq!(*harness.writes.lock().unwrap(), vec![false]);
    harness.controller.shutdown().await;
}

#[tokio::test]
async fn attach_then_detach_without_frames_never_opens_device() {
    let harness = start(HarnessOptions::default());

    let observer = harness.controller.attach_observer("blink").await;
    harness.controller.detach_observer(observer.id).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.source.opens.load(Ordering::SeqCst), 0);
    assert_eq!(harness.source.closes.load(Ordering::SeqCst), 0);
    assert_eq!(harness.controller.stream_state(), StreamState::Idle);
    harness.controller.shutdown().await;
}

#[tokio::test]
async fn device_is_released_once_per_start() {
    let harness = start(HarnessOptions::default());

    for session in 1..=2u64 {
        let mut observer = harness.controller.attach_observer("viewer").await;
        for _ in 0..3 {
            next_event(&mut observer.rx, "frame").await;
        }
        harness.controller.detach_observer(observer.id).await;
        wait_for_state(&harness.controller, StreamState::Idle).await;

        assert_eq!(harness.source.opens.load(Ordering::SeqCst), session);
        assert_eq!(harness.source.closes.load(Ordering::SeqCst), session);
        assert_eq!(harness.controller.stream_stats().sessions, session);
    }
    harness.controller.shutdown().await;
}

#[tokio::test]
async fn stalled_observer_is_dropped_others_keep_streaming() {
    let harness = start(HarnessOptions::default());
    let mut first = harness.controller.attach_observer("first").await;
    let second = harness.controller.attach_observer("second").await;
    let mut third = harness.controller.attach_observer("third").await;

    // the second observer goes away without detaching
    drop(second.rx);

    for _ in 0..3 {
        next_event(&mut first.rx, "frame").await;
        next_event(&mut third.rx, "frame").await;
    }
    let stats = harness.controller.observer_stats().await;
    let ids: Vec<u64> = stats.iter().map(|s| s.id).collect();
    assert!(ids.contains(&first.id));
    assert!(ids.contains(&third.id));
    assert!(!ids.contains(&second.id));
    assert!(stats.iter().all(|s| s.bytes_sent > 0));

    harness.controller.shutdown().await;
}

#[tokio::test]
async fn matcher_failures_leave_frames_unannotated() {
    let harness = start(HarnessOptions {
        matcher_fails: true,
        ..HarnessOptions::default()
    });
    let mut observer = harness.controller.attach_observer("viewer").await;

    for _ in 0..5 {
        let frame = next_event(&mut observer.rx, "frame").await;
        assert!(frame["data"]["detections"].as_array().unwrap().is_empty());
    }
    harness.controller.detach_observer(observer.id).await;
    wait_for_state(&harness.controller, StreamState::Idle).await;

    let stats = harness.controller.stream_stats();
    assert!(stats.matcher_failures >= 5);
    assert_eq!(*harness.writes.lock().unwrap(), vec![false]);
    harness.controller.shutdown().await;
}

#[tokio::test]
async fn read_failures_are_recovered_in_loop() {
    let harness = start(HarnessOptions {
        failing_reads: 4,
        ..HarnessOptions::default()
    });
    let mut observer = harness.controller.attach_observer("viewer").await;

    let frame = next_event(&mut observer.rx, "frame").await;
    assert_eq!(frame["data"]["frame_index"], 0);

    let stats = harness.controller.stream_stats();
    assert_eq!(stats.device_failures, 4);
    // read_retries = 1: every second consecutive failure reopens the device
    assert!(harness.source.opens.load(Ordering::SeqCst) >= 2);
    harness.controller.shutdown().await;
}

#[tokio::test]
async fn idle_snapshot_opens_and_releases_device() {
    let harness = start(HarnessOptions::default());

    let snapshot = harness
        .controller
        .capture_snapshot()
        .await
        .expect("snapshot captured");
    assert_eq!(&snapshot.bytes[..2], &[0xFF, 0xD8]);
    assert_eq!(snapshot.quality, 85);
    assert_eq!((snapshot.width, snapshot.height), (64, 48));
    assert_eq!(harness.source.opens.load(Ordering::SeqCst), 1);
    assert_eq!(harness.source.closes.load(Ordering::SeqCst), 1);
    assert_eq!(harness.controller.stream_state(), StreamState::Idle);
    // snapshots never run recognition while idle
    assert_eq!(harness.matcher_calls.load(Ordering::SeqCst), 0);
    harness.controller.shutdown().await;
}

#[tokio::test]
async fn streaming_snapshot_forces_recognition() {
    let harness = start(HarnessOptions {
        recognition_interval: 100_000,
        ..HarnessOptions::default()
    });
    let mut observer = harness.controller.attach_observer("viewer").await;
    next_event(&mut observer.rx, "frame").await;
    assert_eq!(harness.matcher_calls.load(Ordering::SeqCst), 1);

    let snapshot = harness
        .controller
        .capture_snapshot()
        .await
        .expect("snapshot captured");
    assert_eq!(&snapshot.bytes[..2], &[0xFF, 0xD8]);
    assert_eq!(harness.matcher_calls.load(Ordering::SeqCst), 2);
    // served by the running stream, no extra open
    assert_eq!(harness.source.opens.load(Ordering::SeqCst), 1);
    harness.controller.shutdown().await;
}

#[tokio::test]
async fn settings_updates_are_announced() {
    let harness = start(HarnessOptions::default());
    let mut observer = harness.controller.attach_observer("viewer").await;
    let greeting = next_event(&mut observer.rx, "door_status").await;
    assert_eq!(greeting["data"]["is_unlocked"], false);

    let update = ProfileUpdate {
        jpeg_quality: Some(70),
        ..ProfileUpdate::default()
    };
    let profile = harness
        .controller
        .update_performance_settings(&update)
        .await
        .expect("valid update");
    assert_eq!(profile.jpeg_quality, 70);
    assert_eq!(profile.pacing, Pacing::Unthrottled);

    let announced = next_event(&mut observer.rx, "config_updated").await;
    assert_eq!(announced["data"]["performance"]["jpeg_quality"], 70);
    assert_eq!(announced["data"]["door"]["lock_duration_secs"], 60);

    let rejected = harness
        .controller
        .update_performance_settings(&ProfileUpdate {
            recognition_interval: Some(0),
            ..ProfileUpdate::default()
        })
        .await;
    assert!(rejected.is_err());
    assert_eq!(harness.controller.performance().jpeg_quality, 70);
    harness.controller.shutdown().await;
}

#[tokio::test]
async fn manual_unlock_is_announced_and_lists_users() {
    let harness = start(HarnessOptions {
        // bob: never auto-unlocks
        embedding: vec![5.0, 5.0],
        ..HarnessOptions::default()
    });
    let mut observer = harness.controller.attach_observer("viewer").await;

    let status = harness
        .controller
        .unlock_door(Some(Duration::from_secs(3)))
        .await
        .expect("unlock succeeds");
    assert!(status.is_unlocked);
    let unlocked = next_event(&mut observer.rx, "door_unlocked").await;
    assert_eq!(unlocked["data"]["user"], "manual");
    assert_eq!(unlocked["data"]["duration_secs"], 3);

    harness.controller.lock_door().await.expect("lock succeeds");
    let locked = next_event(&mut observer.rx, "door_locked").await;
    assert_eq!(locked["data"]["manual"], true);

    let users = harness.controller.list_users();
    assert_eq!(users.len(), 2);
    assert!(users.iter().any(|u| u.name == "alice" && u.is_authorized));
    assert!(users.iter().any(|u| u.name == "bob" && !u.is_authorized));
    harness.controller.shutdown().await;
}
