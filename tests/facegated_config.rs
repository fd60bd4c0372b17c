use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use facegate::config::{ActuatorKind, FacegateConfig};
use facegate::settings::Pacing;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FACEGATE_CONFIG",
        "FACEGATE_API_ADDR",
        "FACEGATE_CAMERA_DEVICE",
        "FACEGATE_RELAY_PIN",
        "FACEGATE_LOCK_DURATION_SECS",
        "FACEGATE_UNLOCK_CONFIDENCE",
        "FACEGATE_IDENTITIES_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = FacegateConfig::load().expect("load defaults");
    assert_eq!(cfg.api.addr, "127.0.0.1:8765");
    assert!(!cfg.api.allow_remote);
    assert_eq!(cfg.camera.device, "auto");
    assert_eq!((cfg.camera.width, cfg.camera.height, cfg.camera.fps), (640, 480, 30));
    assert_eq!(cfg.capture.read_retries, 3);
    assert_eq!(cfg.door.actuator, ActuatorKind::Gpio);
    assert_eq!(cfg.door.relay_pin, 12);
    assert_eq!(cfg.door.lock_duration, Duration::from_secs(5));
    assert!(cfg.policy.auto_unlock);
    assert_eq!(cfg.policy.unlock_confidence, 0.8);
    assert_eq!(cfg.recognition.downscale, 4);
    assert_eq!(cfg.performance.recognition_interval, 20);
    assert_eq!(cfg.performance.pacing, Pacing::FrameInterval);
    assert_eq!(cfg.hub.send_timeout, Duration::from_millis(500));
    assert_eq!(cfg.worker_threads, 2);
    assert!(cfg.identities_path.is_none());
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "api": { "addr": "0.0.0.0:9100", "allow_remote": true },
        "camera": { "device": "/dev/video2", "width": 800, "height": 600, "read_retries": 5 },
        "door": { "actuator": "dry_run", "relay_pin": 17, "lock_duration_secs": 9 },
        "recognition": { "match_tolerance": 0.5, "identities_path": "/etc/facegate/ids.json" },
        "performance": { "target_fps": 15.0, "pacing": "unthrottled" },
        "hub": { "queue_depth": 4 },
        "workers": { "threads": 3 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("FACEGATE_CONFIG", file.path());
    std::env::set_var("FACEGATE_RELAY_PIN", "21");
    std::env::set_var("FACEGATE_UNLOCK_CONFIDENCE", "0.85");

    let cfg = FacegateConfig::load().expect("load config");

    assert_eq!(cfg.api.addr, "0.0.0.0:9100");
    assert!(cfg.api.allow_remote);
    assert_eq!(cfg.camera.device, "/dev/video2");
    assert_eq!((cfg.camera.width, cfg.camera.height), (800, 600));
    assert_eq!(cfg.capture.read_retries, 5);
    assert_eq!(cfg.door.actuator, ActuatorKind::DryRun);
    assert_eq!(cfg.door.relay_pin, 21);
    assert_eq!(cfg.door.lock_duration, Duration::from_secs(9));
    assert_eq!(cfg.policy.unlock_confidence, 0.85);
    assert_eq!(cfg.recognition.match_tolerance, 0.5);
    assert_eq!(
        cfg.identities_path.as_deref(),
        Some(std::path::Path::new("/etc/facegate/ids.json"))
    );
    assert_eq!(cfg.performance.target_fps, 15.0);
    assert_eq!(cfg.performance.pacing, Pacing::Unthrottled);
    // untouched profile fields keep their defaults
    assert_eq!(cfg.performance.jpeg_quality, 60);
    assert_eq!(cfg.hub.queue_depth, 4);
    assert_eq!(cfg.worker_threads, 3);

    let controller_cfg = cfg.controller_config();
    assert_eq!(controller_cfg.lock_duration, Duration::from_secs(9));
    assert_eq!(controller_cfg.stream.capture.read_retries, 5);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
stats_interval_secs = 10

[camera]
device = "stub://lab"

[door]
auto_unlock = false
log_confidence = 0.6
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = FacegateConfig::load_with_path(Some(file.path())).expect("load toml");
    assert_eq!(cfg.camera.device, "stub://lab");
    assert!(!cfg.policy.auto_unlock);
    assert_eq!(cfg.policy.log_confidence, 0.6);
    assert_eq!(cfg.stats_interval, Duration::from_secs(10));
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FACEGATE_LOCK_DURATION_SECS", "0");
    assert!(FacegateConfig::load().is_err());

    std::env::set_var("FACEGATE_LOCK_DURATION_SECS", "soon");
    assert!(FacegateConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "performance": { "recognition_interval": 0 } }"#)
        .expect("write config");
    assert!(FacegateConfig::load_with_path(Some(file.path())).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "door": { "unlock_confidence": 1.5 } }"#)
        .expect("write config");
    assert!(FacegateConfig::load_with_path(Some(file.path())).is_err());
}
