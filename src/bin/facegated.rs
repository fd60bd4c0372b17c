//! facegated - face-recognition door controller daemon
//!
//! This daemon:
//! 1. Loads configuration (file + environment overrides)
//! 2. Drives the door relay to locked and owns it from then on
//! 3. Streams annotated frames to every connected observer, starting the
//!    camera on the first connection and releasing it after the last one
//! 4. Unlocks the door for authorized faces and relocks it after the
//!    configured duration
//! 5. Locks the door on shutdown (Ctrl-C)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use facegate::api::ApiServer;
use facegate::config::{ActuatorKind, FacegateConfig};
use facegate::detect::{IdentityStore, InMemoryIdentityStore, Matcher, StubMatcher};
use facegate::door::{Actuator, DryRunActuator, SysfsGpioActuator};
use facegate::encode::SysinfoLoadSampler;
use facegate::{AccessController, CameraSource, ControllerParts};

#[derive(Parser, Debug)]
#[command(author, version, about = "Face-recognition door controller")]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "FACEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Use the synthetic camera instead of a V4L2 device.
    #[arg(long)]
    stub_camera: bool,

    /// Log door actuations instead of driving the relay.
    #[arg(long)]
    dry_run_actuator: bool,

    /// Override the api listen address.
    #[arg(long)]
    api_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = FacegateConfig::load_with_path(args.config.as_deref())?;
    if args.stub_camera {
        cfg.camera.device = "stub://front_door".to_string();
    }
    if args.dry_run_actuator {
        cfg.door.actuator = ActuatorKind::DryRun;
    }
    if let Some(addr) = args.api_addr {
        cfg.api.addr = addr;
    }
    log::info!(
        "facegated {} starting (camera {}, actuator {:?})",
        env!("CARGO_PKG_VERSION"),
        cfg.camera.device,
        cfg.door.actuator
    );

    let identities: Arc<dyn IdentityStore> = match &cfg.identities_path {
        Some(path) => Arc::new(InMemoryIdentityStore::load_json(path)?),
        None => {
            log::warn!("no identities file configured; every face will be unknown");
            Arc::new(InMemoryIdentityStore::new())
        }
    };

    let matcher: Arc<dyn Matcher> = Arc::new(StubMatcher::new());
    if let Err(err) = matcher.warm_up() {
        log::warn!("matcher {} warm-up failed: {}", matcher.name(), err);
    }

    let actuator: Box<dyn Actuator> = match cfg.door.actuator {
        ActuatorKind::Gpio => Box::new(SysfsGpioActuator::with_base(
            cfg.door.gpio_base.clone(),
            cfg.door.relay_pin,
            cfg.door.active_high,
        )),
        ActuatorKind::DryRun => Box::new(DryRunActuator::new()),
    };

    let parts = ControllerParts {
        source: Box::new(CameraSource::new(cfg.camera.clone())),
        matcher,
        identities,
        actuator,
        load_sampler: Box::new(SysinfoLoadSampler::new()),
    };
    let controller = Arc::new(
        AccessController::start(parts, cfg.controller_config())
            .context("start access controller")?,
    );

    let api_handle = ApiServer::new(cfg.api.clone(), Arc::clone(&controller))
        .spawn()
        .await?;
    log::info!("facegated api listening on {}", api_handle.addr);

    log::info!("facegated waiting for shutdown signal (Ctrl-C)...");
    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    log::info!("shutdown signal received, stopping...");

    if let Err(err) = api_handle.stop().await {
        log::error!("api shutdown failed: {}", err);
    }
    controller.shutdown().await;
    log::info!("facegated stopped");
    Ok(())
}
