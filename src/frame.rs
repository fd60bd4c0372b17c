//! Frame buffer type.
//!
//! A `Frame` is an RGB24 pixel buffer with its dimensions and capture time.
//! Frames are ephemeral: the orchestrator owns each one for a single loop
//! iteration and shares it (behind `Arc`) only with the worker jobs of that
//! iteration.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tokio::time::Instant;

use crate::now_epoch_ms;

/// Bytes per pixel of the canonical frame layout.
pub const RGB_CHANNELS: usize = 3;

pub struct Frame {
    /// RGB24, row-major, no padding.
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Wall-clock capture time (for outbound events).
    pub captured_epoch_ms: u64,

    /// Monotonic capture instant (for pacing and age).
    captured_at: Instant,
}

impl Frame {
    /// Wrap an RGB24 buffer. Fails when the length does not match the dimensions.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(RGB_CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_epoch_ms: now_epoch_ms(),
            captured_at: Instant::now(),
        })
    }

    /// Solid-color frame, mostly useful for tests and the synthetic source.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * RGB_CHANNELS);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
            captured_epoch_ms: now_epoch_ms(),
            captured_at: Instant::now(),
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Copy into an `image` buffer (annotation draws on a copy, never the original).
    pub fn to_rgb_image(&self) -> RgbImage {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// Shrink to `max_width` preserving aspect ratio. Narrower frames pass through.
    pub fn fit_width(self, max_width: u32) -> Frame {
        if max_width == 0 || self.width <= max_width {
            return self;
        }
        let height = ((self.height as u64 * max_width as u64) / self.width as u64).max(1) as u32;
        self.resized(max_width, height)
    }

    /// Integer downscale used ahead of recognition. `factor <= 1` copies.
    pub fn downscaled(&self, factor: u32) -> Frame {
        if factor <= 1 {
            return self.copy();
        }
        let width = (self.width / factor).max(1);
        let height = (self.height / factor).max(1);
        self.copy().resized(width, height)
    }

    fn resized(self, width: u32, height: u32) -> Frame {
        let captured_epoch_ms = self.captured_epoch_ms;
        let captured_at = self.captured_at;
        let (src_w, src_h) = (self.width, self.height);
        let image = match RgbImage::from_raw(src_w, src_h, self.data) {
            Some(image) => imageops::resize(&image, width, height, FilterType::Triangle),
            None => RgbImage::new(width, height),
        };
        Frame {
            data: image.into_raw(),
            width,
            height,
            captured_epoch_ms,
            captured_at,
        }
    }

    fn copy(&self) -> Frame {
        Frame {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            captured_epoch_ms: self.captured_epoch_ms,
            captured_at: self.captured_at,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("captured_epoch_ms", &self.captured_epoch_ms)
            .finish_non_exhaustive()
    }
}
