//! V4L2 capture device.
//!
//! `V4l2Device` wraps one open device node and its mmap buffer stream.
//!
//! The device is opened with:
//! - a single capture buffer, so a read always returns the freshest frame
//! - the configured read timeout applied to the stream
//! - YUYV requested, with whatever format the driver settles on normalized to RGB24
//!
//! Dropping the value releases the device node.

use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{CameraConfig, DeviceError};
use crate::frame::Frame;

#[self_referencing]
struct StreamState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

pub struct V4l2Device {
    path: String,
    state: StreamState,
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl V4l2Device {
    /// Open `/dev/video{index}`.
    pub fn open_index(index: u32, config: &CameraConfig) -> Result<Self, DeviceError> {
        Self::open_path(&format!("/dev/video{}", index), config)
    }

    /// Open an explicit device node. Fails unless the node supports video capture.
    pub fn open_path(path: &str, config: &CameraConfig) -> Result<Self, DeviceError> {
        use v4l::buffer::Type;
        use v4l::capability::Flags;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(path)
            .map_err(|err| DeviceError::Unavailable(format!("open {}: {}", path, err)))?;

        let caps = device
            .query_caps()
            .map_err(|err| DeviceError::Unavailable(format!("query {}: {}", path, err)))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(DeviceError::Unavailable(format!(
                "{} ({}) is not a capture device",
                path, caps.card
            )));
        }

        let mut requested = device
            .format()
            .map_err(|err| DeviceError::Unavailable(format!("read format {}: {}", path, err)))?;
        requested.width = config.width;
        requested.height = config.height;
        requested.fourcc = v4l::FourCC::new(b"YUYV");

        let active = match device.set_format(&requested) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Device: failed to set format on {}: {}", path, err);
                device.format().map_err(|err| {
                    DeviceError::Unavailable(format!("read format {}: {}", path, err))
                })?
            }
        };

        let format = PixelFormat::from_fourcc(&active.fourcc.repr).ok_or_else(|| {
            DeviceError::Unavailable(format!(
                "{}: unsupported pixel format {}",
                path, active.fourcc
            ))
        })?;

        if config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Device: failed to set fps on {}: {}", path, err);
            }
        }

        let read_timeout = config.read_timeout;
        let state = StreamStateTryBuilder {
            device,
            stream_builder: |device| {
                let mut stream = v4l::prelude::MmapStream::with_buffers(
                    device,
                    Type::VideoCapture,
                    1,
                )
                .map_err(|err| DeviceError::Unavailable(format!("buffer stream: {}", err)))?;
                stream.set_timeout(read_timeout);
                Ok(stream)
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Device: opened {} ({}x{} {:?})",
            path,
            active.width,
            active.height,
            format
        );

        Ok(Self {
            path: path.to_string(),
            state,
            format,
            width: active.width,
            height: active.height,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read one frame, blocking for at most the configured read timeout.
    pub fn next_frame(&mut self) -> Result<Frame, DeviceError> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.width, self.height, self.format);
        let rgb = self.state.with_stream_mut(|stream| {
            let (buf, meta) = stream
                .next()
                .map_err(|err| DeviceError::ReadFailed(err.to_string()))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let payload = if used == 0 { buf } else { &buf[..used] };
            normalize_to_rgb(payload, width, height, format)
                .map_err(|err| DeviceError::ReadFailed(err.to_string()))
        })?;

        Frame::from_rgb(rgb, width, height).map_err(|err| DeviceError::ReadFailed(err.to_string()))
    }
}
