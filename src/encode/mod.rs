//! Load-adaptive JPEG encoding.
//!
//! Quality banding (base = configured JPEG quality):
//!
//! | load                      | quality              |
//! |---------------------------|----------------------|
//! | cpu > 90% or mem > 90%    | `max(30, base - 20)` |
//! | cpu > 75% or mem > 75%    | `max(40, base - 10)` |
//! | cpu < 50% and mem < 50%   | `min(85, base + 5)`  |
//! | otherwise                 | `base`               |
//!
//! Encoding draws annotations on a copy of the frame, then compresses it.
//! It is CPU-bound and runs on the worker pool, never on the capture path.

mod annotate;
mod font;

use std::time::{Duration, Instant};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use sysinfo::System;

pub use annotate::{box_color, AUTHORIZED_COLOR, UNAUTHORIZED_COLOR, UNKNOWN_COLOR};

use crate::frame::Frame;
use crate::settings::PerformanceProfile;
use crate::Detection;

/// Quality used for snapshot captures.
pub const SNAPSHOT_QUALITY: u8 = 85;

/// One system load sample, in percent.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SystemLoad {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Pick the JPEG quality for the current load.
pub fn choose_quality(load: SystemLoad, base: u8) -> u8 {
    let cpu = load.cpu_percent;
    let mem = load.memory_percent;
    if cpu > 90.0 || mem > 90.0 {
        base.saturating_sub(20).max(30)
    } else if cpu > 75.0 || mem > 75.0 {
        base.saturating_sub(10).max(40)
    } else if cpu < 50.0 && mem < 50.0 {
        base.saturating_add(5).min(85)
    } else {
        base
    }
}

pub trait LoadSampler: Send {
    fn sample(&mut self) -> SystemLoad;
}

/// Samples CPU and memory through `sysinfo`.
///
/// CPU usage is a delta between two refreshes, so samples are cached for
/// `min_interval`; the first sample after construction reports 0% CPU.
pub struct SysinfoLoadSampler {
    system: System,
    min_interval: Duration,
    last: Option<(Instant, SystemLoad)>,
}

impl SysinfoLoadSampler {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            system: System::new(),
            min_interval,
            last: None,
        }
    }

    fn refresh(&mut self) -> SystemLoad {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let cpu_percent = {
            let cpus = self.system.cpus();
            if cpus.is_empty() {
                0.0
            } else {
                cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
            }
        };
        let memory_percent = if self.system.total_memory() > 0 {
            (self.system.used_memory() as f32 / self.system.total_memory() as f32) * 100.0
        } else {
            0.0
        };
        SystemLoad {
            cpu_percent,
            memory_percent,
        }
    }
}

impl Default for SysinfoLoadSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SysinfoLoadSampler {
    fn sample(&mut self) -> SystemLoad {
        if let Some((at, load)) = self.last {
            if at.elapsed() < self.min_interval {
                return load;
            }
        }
        let load = self.refresh();
        self.last = Some((Instant::now(), load));
        load
    }
}

/// Constant load, for tests and fixed-quality deployments.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedLoad(pub SystemLoad);

impl LoadSampler for FixedLoad {
    fn sample(&mut self) -> SystemLoad {
        self.0
    }
}

pub struct LoadAdaptiveEncoder {
    sampler: Box<dyn LoadSampler>,
}

impl LoadAdaptiveEncoder {
    pub fn new(sampler: Box<dyn LoadSampler>) -> Self {
        Self { sampler }
    }

    /// Quality for the next frame under `profile`.
    pub fn quality_for(&mut self, profile: &PerformanceProfile) -> u8 {
        if !profile.adaptive_quality {
            return profile.jpeg_quality;
        }
        choose_quality(self.sampler.sample(), profile.jpeg_quality)
    }
}

/// Compressed frame payload.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub bytes: Bytes,
    pub quality: u8,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EncodeError {
    Codec(String),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Codec(reason) => write!(f, "jpeg encoding failed: {}", reason),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Annotate a copy of `frame` with `detections` and compress it to JPEG.
pub fn encode(
    frame: &Frame,
    quality: u8,
    detections: &[Detection],
) -> Result<EncodedFrame, EncodeError> {
    let mut image = frame.to_rgb_image();
    if !detections.is_empty() {
        annotate::draw_detections(&mut image, detections);
    }

    let quality = quality.clamp(1, 100);
    let mut out = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)
        .map_err(|err| EncodeError::Codec(err.to_string()))?;

    Ok(EncodedFrame {
        bytes: Bytes::from(out),
        quality,
        width: image.width(),
        height: image.height(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    fn load(cpu: f32, mem: f32) -> SystemLoad {
        SystemLoad {
            cpu_percent: cpu,
            memory_percent: mem,
        }
    }

    #[test]
    fn quality_bands() {
        assert_eq!(choose_quality(load(95.0, 20.0), 60), 40);
        assert_eq!(choose_quality(load(30.0, 30.0), 60), 65);
        assert_eq!(choose_quality(load(80.0, 10.0), 60), 50);
        assert_eq!(choose_quality(load(60.0, 40.0), 60), 60);
    }

    #[test]
    fn quality_bands_respect_floors_and_ceiling() {
        assert_eq!(choose_quality(load(10.0, 95.0), 40), 30);
        assert_eq!(choose_quality(load(10.0, 80.0), 45), 40);
        assert_eq!(choose_quality(load(10.0, 10.0), 84), 85);
        assert_eq!(choose_quality(load(10.0, 10.0), 90), 85);
    }

    #[test]
    fn adaptive_off_uses_base_quality() {
        let mut encoder = LoadAdaptiveEncoder::new(Box::new(FixedLoad(load(99.0, 99.0))));
        let mut profile = PerformanceProfile::default();
        assert_eq!(encoder.quality_for(&profile), 40);
        profile.adaptive_quality = false;
        assert_eq!(encoder.quality_for(&profile), 60);
    }

    #[test]
    fn encodes_jpeg_without_touching_frame() -> Result<(), EncodeError> {
        let frame = Frame::filled(64, 48, [40, 40, 40]);
        let detections = [Detection::identified(
            "alice",
            0.9,
            true,
            BoundingBox::new(10, 40, 40, 10),
        )];
        let encoded = encode(&frame, 60, &detections)?;
        assert_eq!(&encoded.bytes[..2], &[0xFF, 0xD8]);
        assert_eq!((encoded.width, encoded.height), (64, 48));
        assert!(frame.pixels().iter().all(|&p| p == 40));
        Ok(())
    }

    #[test]
    fn sysinfo_sampler_reports_percentages() {
        let mut sampler = SysinfoLoadSampler::with_interval(Duration::from_secs(60));
        let first = sampler.sample();
        assert!((0.0..=100.0).contains(&first.memory_percent));
        // cached within the interval
        assert_eq!(sampler.sample(), first);
    }
}
