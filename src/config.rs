use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::controller::ControllerConfig;
use crate::detect::GateSettings;
use crate::door::DEFAULT_RELOCK_RETRY;
use crate::hub::HubConfig;
use crate::ingest::{CameraConfig, CapturePolicy};
use crate::log::MAX_LOG_ENTRIES;
use crate::orchestrator::OrchestratorConfig;
use crate::settings::{validate_lock_duration, AccessPolicy, PerformanceProfile, ProfileUpdate};

const DEFAULT_API_ADDR: &str = "127.0.0.1:8765";
const DEFAULT_RELAY_PIN: u32 = 12;
const DEFAULT_GPIO_BASE: &str = "/sys/class/gpio";
const DEFAULT_LOCK_DURATION_SECS: u64 = 5;
const DEFAULT_WORKER_THREADS: usize = 2;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Deserialize, Default)]
struct FacegateConfigFile {
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    door: Option<DoorConfigFile>,
    recognition: Option<RecognitionConfigFile>,
    performance: Option<ProfileUpdate>,
    hub: Option<HubConfigFile>,
    workers: Option<WorkersConfigFile>,
    stats_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    allow_remote: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    probe_indices: Option<Vec<u32>>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    read_timeout_ms: Option<u64>,
    read_retries: Option<u32>,
    reopen_backoff_ms: Option<u64>,
    max_reopen_attempts: Option<u32>,
    long_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DoorConfigFile {
    actuator: Option<ActuatorKind>,
    relay_pin: Option<u32>,
    active_high: Option<bool>,
    gpio_base: Option<PathBuf>,
    lock_duration_secs: Option<u64>,
    auto_unlock: Option<bool>,
    unlock_confidence: Option<f32>,
    log_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    match_tolerance: Option<f32>,
    downscale: Option<u32>,
    identities_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct HubConfigFile {
    send_timeout_ms: Option<u64>,
    queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct WorkersConfigFile {
    threads: Option<usize>,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorKind {
    Gpio,
    DryRun,
}

#[derive(Debug, Clone)]
pub struct DoorSettings {
    pub actuator: ActuatorKind,
    pub relay_pin: u32,
    pub active_high: bool,
    pub gpio_base: PathBuf,
    pub lock_duration: Duration,
}

#[derive(Debug, Clone)]
pub struct FacegateConfig {
    pub api: ApiConfig,
    pub camera: CameraConfig,
    pub capture: CapturePolicy,
    pub door: DoorSettings,
    pub policy: AccessPolicy,
    pub recognition: GateSettings,
    pub identities_path: Option<PathBuf>,
    pub performance: PerformanceProfile,
    pub hub: HubConfig,
    pub worker_threads: usize,
    pub stats_interval: Duration,
}

impl FacegateConfig {
    /// Defaults, then the file named by `FACEGATE_CONFIG`, then environment
    /// overrides.
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    /// Like `load`, with `path` taking precedence over `FACEGATE_CONFIG`.
    pub fn load_with_path(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("FACEGATE_CONFIG").ok().map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FacegateConfigFile) -> Result<Self> {
        let api_file = file.api.unwrap_or_default();
        let api = ApiConfig {
            addr: api_file
                .addr
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            allow_remote: api_file.allow_remote.unwrap_or(false),
        };

        let camera_file = file.camera.unwrap_or_default();
        let camera_defaults = CameraConfig::default();
        let capture_defaults = CapturePolicy::default();
        let camera = CameraConfig {
            device: camera_file.device.unwrap_or(camera_defaults.device),
            probe_indices: camera_file
                .probe_indices
                .unwrap_or(camera_defaults.probe_indices),
            width: camera_file.width.unwrap_or(camera_defaults.width),
            height: camera_file.height.unwrap_or(camera_defaults.height),
            fps: camera_file.fps.unwrap_or(camera_defaults.fps),
            read_timeout: camera_file
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(camera_defaults.read_timeout),
        };
        let capture = CapturePolicy {
            read_retries: camera_file
                .read_retries
                .unwrap_or(capture_defaults.read_retries),
            reopen_backoff: camera_file
                .reopen_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(capture_defaults.reopen_backoff),
            max_reopen_attempts: camera_file
                .max_reopen_attempts
                .unwrap_or(capture_defaults.max_reopen_attempts),
            long_backoff: camera_file
                .long_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(capture_defaults.long_backoff),
        };

        let door_file = file.door.unwrap_or_default();
        let policy_defaults = AccessPolicy::default();
        let door = DoorSettings {
            actuator: door_file.actuator.unwrap_or(ActuatorKind::Gpio),
            relay_pin: door_file.relay_pin.unwrap_or(DEFAULT_RELAY_PIN),
            active_high: door_file.active_high.unwrap_or(true),
            gpio_base: door_file
                .gpio_base
                .unwrap_or_else(|| PathBuf::from(DEFAULT_GPIO_BASE)),
            lock_duration: Duration::from_secs(
                door_file
                    .lock_duration_secs
                    .unwrap_or(DEFAULT_LOCK_DURATION_SECS),
            ),
        };
        let policy = AccessPolicy {
            auto_unlock: door_file.auto_unlock.unwrap_or(policy_defaults.auto_unlock),
            unlock_confidence: door_file
                .unlock_confidence
                .unwrap_or(policy_defaults.unlock_confidence),
            log_confidence: door_file
                .log_confidence
                .unwrap_or(policy_defaults.log_confidence),
        };

        let recognition_file = file.recognition.unwrap_or_default();
        let gate_defaults = GateSettings::default();
        let recognition = GateSettings {
            match_tolerance: recognition_file
                .match_tolerance
                .unwrap_or(gate_defaults.match_tolerance),
            downscale: recognition_file.downscale.unwrap_or(gate_defaults.downscale),
        };

        let performance = match file.performance {
            Some(update) => PerformanceProfile::default()
                .merged(&update)
                .context("invalid performance section")?,
            None => PerformanceProfile::default(),
        };

        let hub_file = file.hub.unwrap_or_default();
        let hub_defaults = HubConfig::default();
        let hub = HubConfig {
            queue_depth: hub_file.queue_depth.unwrap_or(hub_defaults.queue_depth),
            send_timeout: hub_file
                .send_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(hub_defaults.send_timeout),
        };

        Ok(Self {
            api,
            camera,
            capture,
            door,
            policy,
            recognition,
            identities_path: recognition_file.identities_path,
            performance,
            hub,
            worker_threads: file
                .workers
                .and_then(|workers| workers.threads)
                .unwrap_or(DEFAULT_WORKER_THREADS),
            stats_interval: Duration::from_secs(
                file.stats_interval_secs
                    .unwrap_or(DEFAULT_STATS_INTERVAL_SECS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("FACEGATE_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
            }
        }
        if let Ok(device) = std::env::var("FACEGATE_CAMERA_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        if let Ok(pin) = std::env::var("FACEGATE_RELAY_PIN") {
            self.door.relay_pin = pin
                .parse()
                .map_err(|_| anyhow!("FACEGATE_RELAY_PIN must be a GPIO line number"))?;
        }
        if let Ok(secs) = std::env::var("FACEGATE_LOCK_DURATION_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("FACEGATE_LOCK_DURATION_SECS must be an integer number of seconds")
            })?;
            self.door.lock_duration = Duration::from_secs(secs);
        }
        if let Ok(confidence) = std::env::var("FACEGATE_UNLOCK_CONFIDENCE") {
            self.policy.unlock_confidence = confidence
                .parse()
                .map_err(|_| anyhow!("FACEGATE_UNLOCK_CONFIDENCE must be a number"))?;
        }
        if let Ok(path) = std::env::var("FACEGATE_IDENTITIES_PATH") {
            if !path.trim().is_empty() {
                self.identities_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        validate_lock_duration(self.door.lock_duration.as_secs())?;
        self.policy.validate()?;
        self.performance.validate()?;

        if !(self.recognition.match_tolerance.is_finite() && self.recognition.match_tolerance > 0.0)
        {
            return Err(anyhow!("recognition.match_tolerance must be greater than zero"));
        }
        if self.recognition.downscale == 0 {
            return Err(anyhow!("recognition.downscale must be at least 1"));
        }
        if self.camera.device.trim().is_empty() {
            return Err(anyhow!("camera.device must not be empty"));
        }
        if self.camera.width == 0 || self.camera.height == 0 || self.camera.fps == 0 {
            return Err(anyhow!("camera width, height and fps must be greater than zero"));
        }
        if self.hub.queue_depth == 0 {
            return Err(anyhow!("hub.queue_depth must be at least 1"));
        }
        if self.worker_threads == 0 {
            return Err(anyhow!("workers.threads must be at least 1"));
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            lock_duration: self.door.lock_duration,
            relock_retry: DEFAULT_RELOCK_RETRY,
            performance: self.performance.clone(),
            policy: self.policy.clone(),
            gate: self.recognition.clone(),
            hub: self.hub.clone(),
            stream: OrchestratorConfig {
                capture: self.capture.clone(),
                stats_interval: self.stats_interval,
            },
            worker_threads: self.worker_threads,
            log_capacity: MAX_LOG_ENTRIES,
        }
    }
}

/// JSON by default, TOML for `.toml` files.
fn read_config_file(path: &Path) -> Result<FacegateConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
