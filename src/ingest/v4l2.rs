//! V4L2 frame source.
//!
//! This module provides `V4l2Source` for reading frames from local USB/V4L2
//! devices (e.g. /dev/video0).
//!
//! The V4L2 source is responsible for:
//! - Opening the device node and negotiating the capture size
//! - Capturing frames in-memory through an mmap stream with a short timeout
//! - Normalizing the driver's pixel format to RGB
//! - Telling transient read failures apart from a lost device

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::FrameSource;
use crate::error::CameraError;
use crate::frame::Resolution;

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Frame rate requested from the driver (0 = driver default).
    pub target_fps: u32,
    /// Per-read timeout.
    pub read_timeout: Duration,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 30,
            read_timeout: Duration::from_millis(500),
        }
    }
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this>,
}

/// V4L2 device source.
pub struct V4l2Source {
    config: V4l2Config,
    label: String,
    state: Option<DeviceState>,
    format: PixelFormat,
    resolution: Resolution,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        let label = device_label(&config.device);
        Self {
            config,
            label,
            state: None,
            format: PixelFormat::Rgb24,
            resolution: Resolution::new(0, 0),
            frame_count: 0,
            last_frame_at: None,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }
}

impl FrameSource for V4l2Source {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(&mut self, width: u32, height: u32) -> Result<Resolution> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = width;
        format.height = height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "unsupported pixel format {} on {}",
                format.fourcc,
                self.config.device
            )
        })?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        let read_timeout = self.config.read_timeout;
        let state = DeviceStateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map(|mut stream| {
                        stream.set_timeout(read_timeout);
                        stream
                    })
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        self.state = Some(state);
        self.format = pixel_format;
        self.resolution = Resolution::new(format.width, format.height);

        log::info!(
            "V4l2Source: opened {} ({}, {:?})",
            self.label,
            self.resolution,
            self.format
        );
        Ok(self.resolution)
    }

    fn next_frame(&mut self) -> Result<RgbImage, CameraError> {
        use v4l::io::traits::CaptureStream;

        let format = self.format;
        let Resolution { width, height } = self.resolution;
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CameraError::transient("v4l2 device not opened"))?;

        let image = state.with_stream_mut(|stream| match stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                let data = if used > 0 { &buf[..used] } else { buf };
                normalize_to_rgb(data, width, height, format)
                    .map_err(|err| CameraError::transient(format!("{err:#}")))
            }
            Err(err) => Err(classify_io_error(&err)),
        })?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(image)
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!(
                "V4l2Source: released {} after {} frames",
                self.label,
                self.frame_count
            );
        }
    }
}

/// Map a read error to the capture loop's retry policy.
fn classify_io_error(err: &std::io::Error) -> CameraError {
    match err.raw_os_error() {
        Some(code) if code == libc::ENODEV || code == libc::ENXIO => {
            CameraError::DeviceLost(err.to_string())
        }
        _ => CameraError::transient(err),
    }
}

/// "/dev/video0 (USB Camera)" when sysfs reports a name.
fn device_label(device: &str) -> String {
    let node = std::path::Path::new(device)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match std::fs::read_to_string(format!("/sys/class/video4linux/{node}/name")) {
        Ok(name) if !name.trim().is_empty() => format!("{} ({})", device, name.trim()),
        _ => device.to_string(),
    }
}
