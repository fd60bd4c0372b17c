//! Lock actuators.
//!
//! An actuator drives the relay that holds the door lock. `set_open(true)`
//! releases the lock, `set_open(false)` engages it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hardware write failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActuatorError {
    /// The output line could not be acquired (not exported, permission denied).
    Unavailable(String),
    /// Writing the output level failed.
    WriteFailed(String),
    /// The unlock would end past the representable clock range. Nothing was written.
    DurationOutOfRange(Duration),
}

impl std::fmt::Display for ActuatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActuatorError::Unavailable(reason) => write!(f, "actuator unavailable: {}", reason),
            ActuatorError::WriteFailed(reason) => write!(f, "actuator write failed: {}", reason),
            ActuatorError::DurationOutOfRange(duration) => {
                write!(f, "unlock duration {:?} out of range", duration)
            }
        }
    }
}

impl std::error::Error for ActuatorError {}

pub trait Actuator: Send {
    fn set_open(&mut self, open: bool) -> Result<(), ActuatorError>;

    /// Short description for status reports and logs.
    fn describe(&self) -> String;
}

/// Relay on a Linux sysfs GPIO line (`/sys/class/gpio/gpioN`).
pub struct SysfsGpioActuator {
    base: PathBuf,
    pin: u32,
    active_high: bool,
    configured: bool,
}

impl SysfsGpioActuator {
    pub fn new(pin: u32, active_high: bool) -> Self {
        Self::with_base("/sys/class/gpio", pin, active_high)
    }

    /// Use an alternate sysfs root (test fixtures, chroots).
    pub fn with_base(base: impl Into<PathBuf>, pin: u32, active_high: bool) -> Self {
        Self {
            base: base.into(),
            pin,
            active_high,
            configured: false,
        }
    }

    fn pin_dir(&self) -> PathBuf {
        self.base.join(format!("gpio{}", self.pin))
    }

    /// Export the line if needed and make it an output.
    fn configure(&mut self) -> Result<(), ActuatorError> {
        let pin_dir = self.pin_dir();
        if !pin_dir.exists() {
            write_attr(&self.base.join("export"), &self.pin.to_string())
                .map_err(ActuatorError::Unavailable)?;
        }
        if !pin_dir.exists() {
            return Err(ActuatorError::Unavailable(format!(
                "{} did not appear after export",
                pin_dir.display()
            )));
        }
        write_attr(&pin_dir.join("direction"), "out").map_err(ActuatorError::Unavailable)?;
        self.configured = true;
        log::info!(
            "SysfsGpioActuator: configured pin {} as output (active_{})",
            self.pin,
            if self.active_high { "high" } else { "low" }
        );
        Ok(())
    }
}

impl Actuator for SysfsGpioActuator {
    fn set_open(&mut self, open: bool) -> Result<(), ActuatorError> {
        if !self.configured {
            self.configure()?;
        }
        let level = if open == self.active_high { "1" } else { "0" };
        write_attr(&self.pin_dir().join("value"), level).map_err(|err| {
            // re-run export/direction on the next write
            self.configured = false;
            ActuatorError::WriteFailed(err)
        })
    }

    fn describe(&self) -> String {
        format!("gpio{}", self.pin)
    }
}

fn write_attr(path: &Path, value: &str) -> Result<(), String> {
    fs::write(path, value).map_err(|err| format!("{}: {}", path.display(), err))
}

/// Actuator that only logs. Used when no relay is wired up.
#[derive(Debug, Default)]
pub struct DryRunActuator {
    open: bool,
}

impl DryRunActuator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Actuator for DryRunActuator {
    fn set_open(&mut self, open: bool) -> Result<(), ActuatorError> {
        self.open = open;
        log::info!(
            "DryRunActuator: relay {}",
            if open { "energized (unlocked)" } else { "released (locked)" }
        );
        Ok(())
    }

    fn describe(&self) -> String {
        "dry-run".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(pin: u32) -> anyhow::Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        let pin_dir = dir.path().join(format!("gpio{}", pin));
        fs::create_dir(&pin_dir)?;
        fs::write(pin_dir.join("direction"), "in")?;
        fs::write(pin_dir.join("value"), "0")?;
        Ok(dir)
    }

    #[test]
    fn gpio_writes_levels_active_high() -> anyhow::Result<()> {
        let sysfs = fake_sysfs(12)?;
        let mut actuator = SysfsGpioActuator::with_base(sysfs.path(), 12, true);

        actuator.set_open(true)?;
        let pin_dir = sysfs.path().join("gpio12");
        assert_eq!(fs::read_to_string(pin_dir.join("direction"))?, "out");
        assert_eq!(fs::read_to_string(pin_dir.join("value"))?, "1");

        actuator.set_open(false)?;
        assert_eq!(fs::read_to_string(pin_dir.join("value"))?, "0");
        Ok(())
    }

    #[test]
    fn gpio_active_low_inverts() -> anyhow::Result<()> {
        let sysfs = fake_sysfs(5)?;
        let mut actuator = SysfsGpioActuator::with_base(sysfs.path(), 5, false);
        actuator.set_open(true)?;
        assert_eq!(fs::read_to_string(sysfs.path().join("gpio5/value"))?, "0");
        Ok(())
    }

    #[test]
    fn gpio_missing_line_is_unavailable() -> anyhow::Result<()> {
        let sysfs = tempfile::tempdir()?;
        // export "succeeds" (plain file) but the pin directory never appears
        let mut actuator = SysfsGpioActuator::with_base(sysfs.path(), 7, true);
        assert!(matches!(
            actuator.set_open(true),
            Err(ActuatorError::Unavailable(_))
        ));
        Ok(())
    }
}
