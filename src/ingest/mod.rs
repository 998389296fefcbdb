//! Frame sources and camera discovery.
//!
//! This module provides the device side of the pipeline:
//! - `FrameSource`: one opened camera, read by exactly one capture loop
//! - `CameraDiscovery`: turns configuration into a list of candidate sources
//! - Synthetic `stub://` sources (testing, demos)
//! - USB/V4L2 devices (feature: ingest-v4l2)
//!
//! Sources hand out owned RGB images. They never retain, store or forward a
//! frame after returning it.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use image::RgbImage;
use serde::Serialize;

use crate::error::CameraError;
use crate::frame::Resolution;

pub use synthetic::{SyntheticConfig, SyntheticFailure, SyntheticSource};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Source};

/// One camera device.
///
/// `open` is called once at registration. After that the source belongs to a
/// single capture loop, which calls `next_frame` until shutdown and then
/// `release`.
pub trait FrameSource: Send {
    /// Human readable device label (path plus driver name when known).
    fn label(&self) -> &str;

    /// Open the device, asking for the given size. Returns the size the device
    /// actually delivers; it stays fixed for the life of the source.
    fn open(&mut self, width: u32, height: u32) -> Result<Resolution>;

    /// Blocking read with a short device timeout.
    ///
    /// Errors are `CameraError::TransientReadFailure` (retry) or
    /// `CameraError::DeviceLost` (stop).
    fn next_frame(&mut self) -> Result<RgbImage, CameraError>;

    /// Release the device. Called once when capture stops.
    fn release(&mut self) {}
}

/// Produces the candidate devices for startup registration.
pub trait CameraDiscovery {
    fn discover(&self) -> Result<Vec<Box<dyn FrameSource>>>;
}

/// Discovery from a configured list of device specs.
///
/// `stub://<name>` specs become synthetic sources; anything else is treated as
/// a V4L2 device path. With an empty list, `/dev/video0 .. /dev/video{max-1}`
/// are probed and the ones that exist are returned.
#[derive(Clone, Debug)]
pub struct DeviceListDiscovery {
    devices: Vec<String>,
    max_devices: usize,
}

impl DeviceListDiscovery {
    pub fn new(devices: Vec<String>, max_devices: usize) -> Self {
        Self {
            devices,
            max_devices,
        }
    }

    fn specs(&self) -> Vec<String> {
        if !self.devices.is_empty() {
            return self.devices.clone();
        }
        (0..self.max_devices)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .collect()
    }
}

impl CameraDiscovery for DeviceListDiscovery {
    fn discover(&self) -> Result<Vec<Box<dyn FrameSource>>> {
        let specs = self.specs();
        if specs.is_empty() {
            log::warn!("camera discovery: no device specs configured and no /dev/video* nodes found");
        }
        let mut sources = Vec::with_capacity(specs.len());
        for spec in specs {
            match source_for_spec(&spec) {
                Ok(source) => sources.push(source),
                Err(err) => log::warn!("camera discovery: skipping {}: {:#}", spec, err),
            }
        }
        Ok(sources)
    }
}

/// Build an unopened source for one device spec.
pub fn source_for_spec(spec: &str) -> Result<Box<dyn FrameSource>> {
    if spec.starts_with(synthetic::SCHEME) {
        return Ok(Box::new(SyntheticSource::parse(spec)?));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Box::new(V4l2Source::new(V4l2Config {
            device: spec.to_string(),
            ..V4l2Config::default()
        })))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        bail!("device {} requires the ingest-v4l2 feature", spec)
    }
}

/// A `/dev/video*` node and its driver-reported name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VideoDevice {
    pub path: PathBuf,
    pub name: String,
}

/// List `/dev/video*` nodes ordered by index, with names from sysfs.
pub fn probe_video_devices() -> Result<Vec<VideoDevice>> {
    probe_video_devices_in(Path::new("/dev"), Path::new("/sys/class/video4linux"))
}

fn probe_video_devices_in(dev_dir: &Path, sysfs_dir: &Path) -> Result<Vec<VideoDevice>> {
    if !dev_dir.is_dir() {
        bail!("{} is not a directory", dev_dir.display());
    }
    let mut nodes: Vec<(u32, String)> = std::fs::read_dir(dev_dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| {
            let index = name.strip_prefix("video")?.parse::<u32>().ok()?;
            Some((index, name))
        })
        .collect();
    nodes.sort();

    Ok(nodes
        .into_iter()
        .map(|(_, node)| {
            let name = std::fs::read_to_string(sysfs_dir.join(&node).join("name"))
                .map(|raw| raw.trim().to_string())
                .unwrap_or_else(|_| "Unknown".to_string());
            VideoDevice {
                path: dev_dir.join(node),
                name,
            }
        })
        .collect())
}
