//! Camera frame source.
//!
//! `CameraSource` picks its backend from the configured device:
//! - `stub://<name>` uses a synthetic scene generator (always opens)
//! - `auto` probes `/dev/video{N}` over `probe_indices` and uses the first ready device
//! - any other value is treated as an explicit device path
//!
//! Real devices require the `ingest-v4l2` feature.

use std::time::Duration;

use super::{DeviceError, FrameSource};
use crate::frame::Frame;

/// Configuration for a camera source.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraConfig {
    /// `auto`, a device path (e.g. "/dev/video0"), or `stub://<name>`.
    pub device: String,
    /// Indices tried in order when `device` is `auto`.
    pub probe_indices: Vec<u32>,
    /// Requested capture width.
    pub width: u32,
    /// Requested capture height.
    pub height: u32,
    /// Requested device frame rate.
    pub fps: u32,
    /// Upper bound for a single blocking read.
    pub read_timeout: Duration,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "auto".to_string(),
            probe_indices: vec![0, 1, 2],
            width: 640,
            height: 480,
            fps: 30,
            read_timeout: Duration::from_secs(2),
        }
    }
}

impl CameraConfig {
    pub fn is_synthetic(&self) -> bool {
        self.device.starts_with("stub://")
    }
}

/// Statistics for a camera source.
#[derive(Clone, Debug, Default)]
pub struct CameraStats {
    pub frames_captured: u64,
    pub opens: u64,
    pub device: String,
}

/// Camera frame source.
pub struct CameraSource {
    config: CameraConfig,
    backend: CameraBackend,
    stats: CameraStats,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "ingest-v4l2")]
    Device(Option<super::v4l2::V4l2Device>),
    #[cfg(not(feature = "ingest-v4l2"))]
    Unsupported,
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Self {
        let backend = if config.is_synthetic() {
            CameraBackend::Synthetic(SyntheticCamera::new(config.width, config.height))
        } else {
            #[cfg(feature = "ingest-v4l2")]
            {
                CameraBackend::Device(None)
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                CameraBackend::Unsupported
            }
        };
        let stats = CameraStats {
            device: config.device.clone(),
            ..CameraStats::default()
        };
        Self {
            config,
            backend,
            stats,
        }
    }

    pub fn stats(&self) -> CameraStats {
        self.stats.clone()
    }

    #[cfg(feature = "ingest-v4l2")]
    fn open_device(&self) -> Result<super::v4l2::V4l2Device, DeviceError> {
        use super::v4l2::V4l2Device;

        if self.config.device != "auto" {
            return V4l2Device::open_path(&self.config.device, &self.config);
        }
        let mut last_error = None;
        for &index in &self.config.probe_indices {
            match V4l2Device::open_index(index, &self.config) {
                Ok(device) => return Ok(device),
                Err(err) => {
                    log::info!("CameraSource: failed to open camera at index {}: {}", index, err);
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            DeviceError::Unavailable("no camera indices configured".to_string())
        }))
    }
}

impl FrameSource for CameraSource {
    fn open(&mut self) -> Result<(), DeviceError> {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => {
                camera.open = true;
                log::info!("CameraSource: opened {} (synthetic)", self.config.device);
            }
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(_) => {
                let device = self.open_device()?;
                self.stats.device = device.path().to_string();
                self.backend = CameraBackend::Device(Some(device));
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            CameraBackend::Unsupported => {
                return Err(DeviceError::Unavailable(format!(
                    "{}: camera devices require the ingest-v4l2 feature",
                    self.config.device
                )));
            }
        }
        self.stats.opens += 1;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame, DeviceError> {
        let frame = match &mut self.backend {
            CameraBackend::Synthetic(camera) => camera.next_frame()?,
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(Some(device)) => device.next_frame()?,
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(None) => {
                return Err(DeviceError::Unavailable("camera not open".to_string()))
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            CameraBackend::Unsupported => {
                return Err(DeviceError::Unavailable("camera not open".to_string()))
            }
        };
        self.stats.frames_captured += 1;
        Ok(frame)
    }

    fn close(&mut self) {
        match &mut self.backend {
            CameraBackend::Synthetic(camera) => {
                if camera.open {
                    camera.open = false;
                    log::info!("CameraSource: released {}", self.config.device);
                }
            }
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(device) => {
                if let Some(device) = device.take() {
                    log::info!("CameraSource: released {}", device.path());
                }
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            CameraBackend::Unsupported => {}
        }
    }

    fn is_open(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(camera) => camera.open,
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::Device(device) => device.is_some(),
            #[cfg(not(feature = "ingest-v4l2"))]
            CameraBackend::Unsupported => false,
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} ({}x{}@{})",
            self.stats.device, self.config.width, self.config.height, self.config.fps
        )
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for bring-up and tests
// ----------------------------------------------------------------------------

struct SyntheticCamera {
    width: u32,
    height: u32,
    open: bool,
    frame_count: u64,
}

impl SyntheticCamera {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            open: false,
            frame_count: 0,
        }
    }

    fn next_frame(&mut self) -> Result<Frame, DeviceError> {
        if !self.open {
            return Err(DeviceError::Unavailable("synthetic camera not open".to_string()));
        }
        self.frame_count += 1;
        Frame::from_rgb(self.generate_pixels(), self.width, self.height)
            .map_err(|err| DeviceError::ReadFailed(err.to_string()))
    }

    /// Gradient background with a bright square drifting across it.
    fn generate_pixels(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let side = (w.min(h) / 4).max(1);
        let span = w.saturating_sub(side).max(1);
        let x0 = (self.frame_count as usize * 4) % span;
        let y0 = h.saturating_sub(side) / 2;

        let mut pixels = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let offset = (y * w + x) * 3;
                let inside = x >= x0 && x < x0 + side && y >= y0 && y < y0 + side;
                if inside {
                    pixels[offset..offset + 3].copy_from_slice(&[230, 200, 170]);
                } else {
                    pixels[offset] = (x * 255 / w.max(1)) as u8;
                    pixels[offset + 1] = (y * 255 / h.max(1)) as u8;
                    pixels[offset + 2] = (self.frame_count % 256) as u8;
                }
            }
        }
        pixels
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> CameraConfig {
        CameraConfig {
            device: "stub://front_door".to_string(),
            width: 64,
            height: 48,
            ..CameraConfig::default()
        }
    }

    #[test]
    fn synthetic_source_produces_frames_after_open() -> Result<(), DeviceError> {
        let mut source = CameraSource::new(stub_config());
        assert!(!source.is_open());
        assert!(source.next_frame().is_err());

        source.open()?;
        let frame = source.next_frame()?;
        assert_eq!((frame.width, frame.height), (64, 48));
        assert_eq!(source.stats().frames_captured, 1);
        assert_eq!(source.stats().opens, 1);
        Ok(())
    }

    #[test]
    fn synthetic_frames_change_between_reads() -> Result<(), DeviceError> {
        let mut source = CameraSource::new(stub_config());
        source.open()?;
        let first = source.next_frame()?;
        let second = source.next_frame()?;
        assert_ne!(first.pixels(), second.pixels());
        Ok(())
    }

    #[test]
    fn close_releases_and_is_idempotent() -> Result<(), DeviceError> {
        let mut source = CameraSource::new(stub_config());
        source.open()?;
        source.close();
        source.close();
        assert!(!source.is_open());
        Ok(())
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    #[test]
    fn device_paths_need_v4l2_feature() {
        let mut source = CameraSource::new(CameraConfig::default());
        assert!(matches!(source.open(), Err(DeviceError::Unavailable(_))));
    }
}
