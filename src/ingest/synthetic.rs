//! Synthetic frame source for `stub://` device specs.
//!
//! Spec format: `stub://<name>[?fail=open|warmup|reads][&lost_after=<n>][&fps=<n>]`
//!
//! - `fail=open`: `open` fails
//! - `fail=warmup`: opens, but every read fails
//! - `fail=reads`: the first read succeeds (so registration passes), every later
//!   read fails with a transient error
//! - `lost_after=<n>`: after `n` successful reads the device reports itself lost
//! - `fps=<n>`: native device rate the source emulates (default 30, 0 = as fast
//!   as possible)

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use image::{Rgb, RgbImage};

use super::FrameSource;
use crate::error::CameraError;
use crate::frame::Resolution;

pub(crate) const SCHEME: &str = "stub://";
const DEFAULT_NATIVE_FPS: u32 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyntheticFailure {
    Open,
    Warmup,
    Reads,
}

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Device spec, used as the label.
    pub spec: String,
    pub failure: Option<SyntheticFailure>,
    pub lost_after: Option<u64>,
    pub native_fps: u32,
}

impl SyntheticConfig {
    pub fn new(name: &str) -> Self {
        Self {
            spec: format!("{SCHEME}{name}"),
            failure: None,
            lost_after: None,
            native_fps: DEFAULT_NATIVE_FPS,
        }
    }

    pub fn parse(spec: &str) -> Result<Self> {
        let rest = spec
            .strip_prefix(SCHEME)
            .ok_or_else(|| anyhow!("synthetic device spec must start with {}", SCHEME))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        if name.is_empty() {
            bail!("synthetic device spec {} has no name", spec);
        }
        let mut config = Self {
            spec: spec.to_string(),
            ..Self::new(name)
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed option '{}' in {}", pair, spec))?;
            match key {
                "fail" => {
                    config.failure = Some(match value {
                        "open" => SyntheticFailure::Open,
                        "warmup" => SyntheticFailure::Warmup,
                        "reads" => SyntheticFailure::Reads,
                        other => bail!("unknown failure mode '{}' in {}", other, spec),
                    })
                }
                "lost_after" => {
                    config.lost_after = Some(
                        value
                            .parse()
                            .with_context(|| format!("lost_after must be an integer in {spec}"))?,
                    )
                }
                "fps" => {
                    config.native_fps = value
                        .parse()
                        .with_context(|| format!("fps must be an integer in {spec}"))?
                }
                other => bail!("unknown option '{}' in {}", other, spec),
            }
        }
        Ok(config)
    }
}

/// Generates a moving gradient at the opened resolution.
pub struct SyntheticSource {
    config: SyntheticConfig,
    resolution: Option<Resolution>,
    reads: u64,
    frames_delivered: u64,
    last_read_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            resolution: None,
            reads: 0,
            frames_delivered: 0,
            last_read_at: None,
        }
    }

    pub fn parse(spec: &str) -> Result<Self> {
        Ok(Self::new(SyntheticConfig::parse(spec)?))
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    /// Sleep so reads do not outpace the emulated device rate.
    fn pace(&mut self) {
        if self.config.native_fps == 0 {
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / self.config.native_fps as f64);
        if let Some(last) = self.last_read_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last_read_at = Some(Instant::now());
    }

    fn generate(&self, resolution: Resolution) -> RgbImage {
        let shift = self.frames_delivered as u32;
        RgbImage::from_fn(resolution.width, resolution.height, |x, y| {
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift / 2) % 256) as u8,
                ((x ^ y) % 256) as u8,
            ])
        })
    }
}

impl FrameSource for SyntheticSource {
    fn label(&self) -> &str {
        &self.config.spec
    }

    fn open(&mut self, width: u32, height: u32) -> Result<Resolution> {
        if self.config.failure == Some(SyntheticFailure::Open) {
            bail!("synthetic open failure");
        }
        if width == 0 || height == 0 {
            bail!("requested resolution {}x{} is empty", width, height);
        }
        let resolution = Resolution::new(width, height);
        self.resolution = Some(resolution);
        log::info!(
            "SyntheticSource: opened {} ({})",
            self.config.spec,
            resolution
        );
        Ok(resolution)
    }

    fn next_frame(&mut self) -> Result<RgbImage, CameraError> {
        let resolution = self
            .resolution
            .ok_or_else(|| CameraError::transient("synthetic device not opened"))?;
        self.pace();
        self.reads += 1;

        match self.config.failure {
            Some(SyntheticFailure::Warmup) => {
                return Err(CameraError::transient("synthetic read failure"))
            }
            Some(SyntheticFailure::Reads) if self.reads > 1 => {
                return Err(CameraError::transient("synthetic read failure"))
            }
            _ => {}
        }
        if let Some(limit) = self.config.lost_after {
            if self.frames_delivered >= limit {
                return Err(CameraError::DeviceLost(format!(
                    "{} unplugged after {} frames",
                    self.config.spec, limit
                )));
            }
        }

        let image = self.generate(resolution);
        self.frames_delivered += 1;
        Ok(image)
    }

    fn release(&mut self) {
        if self.resolution.take().is_some() {
            log::info!("SyntheticSource: released {}", self.config.spec);
        }
    }
}
