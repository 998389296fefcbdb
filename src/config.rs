use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::capture::{CaptureSettings, DEFAULT_CAPTURE_FPS, DEFAULT_READ_BACKOFF};
use crate::frame::Resolution;
use crate::registry::{WarmupPolicy, DEFAULT_WARMUP_ATTEMPTS};
use crate::scheduler::{
    SchedulerConfig, DEFAULT_DETECTION_INTERVAL, DEFAULT_MAX_CONCURRENT_INFERENCES,
};
use crate::stream::{StreamSettings, DEFAULT_JPEG_QUALITY, DEFAULT_STREAM_FPS};

const DEFAULT_MAX_DEVICES: usize = 3;
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
const DEFAULT_BACKEND: &str = "null";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_CONFIDENCE: f32 = 0.25;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CamwatchConfigFile {
    devices: Option<Vec<String>>,
    max_devices: Option<usize>,
    capture: Option<CaptureConfigFile>,
    stream: Option<StreamConfigFile>,
    inference: Option<InferenceConfigFile>,
    api: Option<ApiConfigFile>,
    debug: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    warmup_attempts: Option<u32>,
    read_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    jpeg_quality: Option<u8>,
    annotate: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct InferenceConfigFile {
    detection_interval: Option<u64>,
    max_concurrent: Option<usize>,
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence: Option<f32>,
    iou: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CamwatchConfig {
    /// Device specs (`/dev/videoN` or `stub://name`). Empty means probe.
    pub devices: Vec<String>,
    pub max_devices: usize,
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
    pub inference: InferenceConfig,
    pub api_addr: String,
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    /// 0 = unpaced
    pub target_fps: u32,
    pub warmup_attempts: u32,
    pub read_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Unset dimensions follow the capture size.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: u32,
    pub jpeg_quality: u8,
    pub annotate: bool,
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub detection_interval: u64,
    pub max_concurrent: usize,
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub confidence: f32,
    pub iou: f32,
}

impl Default for CamwatchConfig {
    fn default() -> Self {
        Self::from_file(CamwatchConfigFile::default())
    }
}

impl CamwatchConfig {
    /// Load from the file named by `CAMWATCH_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMWATCH_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => CamwatchConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamwatchConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let inference = file.inference.unwrap_or_default();
        Self {
            devices: file.devices.unwrap_or_default(),
            max_devices: file.max_devices.unwrap_or(DEFAULT_MAX_DEVICES),
            capture: CaptureConfig {
                width: capture.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                target_fps: capture.target_fps.unwrap_or(DEFAULT_CAPTURE_FPS),
                warmup_attempts: capture.warmup_attempts.unwrap_or(DEFAULT_WARMUP_ATTEMPTS),
                read_backoff: capture
                    .read_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_READ_BACKOFF),
            },
            stream: StreamConfig {
                width: stream.width,
                height: stream.height,
                fps: stream.fps.unwrap_or(DEFAULT_STREAM_FPS),
                jpeg_quality: stream.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                annotate: stream.annotate.unwrap_or(true),
            },
            inference: InferenceConfig {
                detection_interval: inference
                    .detection_interval
                    .unwrap_or(DEFAULT_DETECTION_INTERVAL),
                max_concurrent: inference
                    .max_concurrent
                    .unwrap_or(DEFAULT_MAX_CONCURRENT_INFERENCES),
                backend: inference
                    .backend
                    .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                model_path: inference.model_path,
                input_size: inference.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
                confidence: inference.confidence.unwrap_or(DEFAULT_CONFIDENCE),
                iou: inference.iou.unwrap_or(DEFAULT_IOU),
            },
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            debug: file.debug.unwrap_or(false),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(devices) = std::env::var("CAMWATCH_DEVICES") {
            let parsed = split_csv(&devices);
            if !parsed.is_empty() {
                self.devices = parsed;
            }
        }
        if let Some(width) = env_parse("CAMWATCH_CAPTURE_WIDTH")? {
            self.capture.width = width;
        }
        if let Some(height) = env_parse("CAMWATCH_CAPTURE_HEIGHT")? {
            self.capture.height = height;
        }
        if let Some(fps) = env_parse("CAMWATCH_CAPTURE_FPS")? {
            self.capture.target_fps = fps;
        }
        if let Some(width) = env_parse("CAMWATCH_STREAM_WIDTH")? {
            self.stream.width = Some(width);
        }
        if let Some(height) = env_parse("CAMWATCH_STREAM_HEIGHT")? {
            self.stream.height = Some(height);
        }
        if let Some(fps) = env_parse("CAMWATCH_STREAM_FPS")? {
            self.stream.fps = fps;
        }
        if let Some(quality) = env_parse("CAMWATCH_JPEG_QUALITY")? {
            self.stream.jpeg_quality = quality;
        }
        if let Some(interval) = env_parse("CAMWATCH_DETECTION_INTERVAL")? {
            self.inference.detection_interval = interval;
        }
        if let Some(max) = env_parse("CAMWATCH_MAX_INFERENCES")? {
            self.inference.max_concurrent = max;
        }
        if let Ok(backend) = std::env::var("CAMWATCH_DETECTOR") {
            if !backend.trim().is_empty() {
                self.inference.backend = backend.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("CAMWATCH_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.inference.model_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(addr) = std::env::var("CAMWATCH_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(debug) = std::env::var("CAMWATCH_DEBUG") {
            self.debug = parse_flag(&debug)
                .ok_or_else(|| anyhow!("CAMWATCH_DEBUG must be true/false or 1/0"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture resolution must be non-zero"));
        }
        if self.stream.width == Some(0) || self.stream.height == Some(0) {
            return Err(anyhow!("stream resolution must be non-zero"));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }
        if self.inference.detection_interval == 0 {
            return Err(anyhow!("detection_interval must be greater than zero"));
        }
        if self.inference.max_concurrent == 0 {
            return Err(anyhow!("max_concurrent inferences must be greater than zero"));
        }
        if self.devices.is_empty() && self.max_devices == 0 {
            return Err(anyhow!("max_devices must be greater than zero when probing"));
        }
        if !(0.0..=1.0).contains(&self.inference.confidence) {
            return Err(anyhow!("confidence must be within 0.0..=1.0"));
        }
        if !(0.0..=1.0).contains(&self.inference.iou) {
            return Err(anyhow!("iou must be within 0.0..=1.0"));
        }
        if self.api_addr.trim().is_empty() {
            return Err(anyhow!("api addr must not be empty"));
        }
        Ok(())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            target_fps: (self.capture.target_fps > 0).then_some(self.capture.target_fps),
            read_backoff: self.capture.read_backoff,
        }
    }

    pub fn warmup_policy(&self) -> WarmupPolicy {
        WarmupPolicy {
            attempts: self.capture.warmup_attempts,
            backoff: self.capture.read_backoff,
        }
    }

    /// `None` when the stream follows the negotiated capture size.
    pub fn stream_resolution(&self) -> Option<Resolution> {
        match (self.stream.width, self.stream.height) {
            (None, None) => None,
            (width, height) => Some(Resolution::new(
                width.unwrap_or(self.capture.width),
                height.unwrap_or(self.capture.height),
            )),
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            resolution: self.stream_resolution(),
            fps: self.stream.fps,
            annotate: self.stream.annotate,
            ..StreamSettings::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            detection_interval: self.inference.detection_interval,
            max_concurrent_inferences: self.inference.max_concurrent,
        }
    }
}

fn read_config_file(path: &Path) -> Result<CamwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value: {}", key, raw)),
        _ => Ok(None),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
