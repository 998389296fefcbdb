//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use image::RgbImage;

use camwatch::ingest::{CameraDiscovery, FrameSource};
use camwatch::{
    BoundingBox, CameraError, CaptureSettings, Detection, DetectionSet, Detector, Frame,
    PipelineSettings, Resolution, SchedulerConfig, StreamSettings, WarmupPolicy,
};

pub const WIDTH: u32 = 32;
pub const HEIGHT: u32 = 24;

/// Device fed by the test through a channel. An empty channel reads as a
/// transient timeout; a dropped sender reads as an unplugged device.
pub struct ScriptedSource {
    label: String,
    frames: Receiver<RgbImage>,
}

impl ScriptedSource {
    /// The source is primed with one warm-up frame so registration succeeds.
    pub fn new(label: &str) -> (Self, Sender<RgbImage>) {
        let (tx, rx) = mpsc::channel();
        tx.send(RgbImage::new(WIDTH, HEIGHT)).unwrap();
        (
            Self {
                label: label.to_string(),
                frames: rx,
            },
            tx,
        )
    }
}

impl FrameSource for ScriptedSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn open(&mut self, width: u32, height: u32) -> Result<Resolution> {
        Ok(Resolution::new(width, height))
    }

    fn next_frame(&mut self) -> Result<RgbImage, CameraError> {
        match self.frames.recv_timeout(Duration::from_millis(5)) {
            Ok(image) => Ok(image),
            Err(RecvTimeoutError::Timeout) => Err(CameraError::transient("read timeout")),
            Err(RecvTimeoutError::Disconnected) => {
                Err(CameraError::DeviceLost(format!("{} unplugged", self.label)))
            }
        }
    }
}

/// Hands out a fixed set of sources once.
pub struct FixedDiscovery {
    sources: Mutex<Vec<Box<dyn FrameSource>>>,
}

impl FixedDiscovery {
    pub fn new(sources: Vec<Box<dyn FrameSource>>) -> Self {
        Self {
            sources: Mutex::new(sources),
        }
    }
}

impl CameraDiscovery for FixedDiscovery {
    fn discover(&self) -> Result<Vec<Box<dyn FrameSource>>> {
        Ok(std::mem::take(&mut *self.sources.lock().unwrap()))
    }
}

/// Always reports the same single box.
pub struct FixedDetector {
    pub detection: Detection,
}

impl FixedDetector {
    pub fn new() -> Self {
        Self {
            detection: Detection::new(7, 0.9, BoundingBox::new(2.0, 3.0, 20.0, 18.0)),
        }
    }
}

impl Detector for FixedDetector {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn detect(&self, _frame: &Frame) -> Result<DetectionSet> {
        Ok(DetectionSet::new(vec![self.detection.clone()]))
    }
}

/// Sleeps per call and records the highest number of overlapping calls.
pub struct SlowDetector {
    pub delay: Duration,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl SlowDetector {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }
}

impl Detector for SlowDetector {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn detect(&self, _frame: &Frame) -> Result<DetectionSet> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(DetectionSet::empty())
    }
}

pub fn settings(detection_interval: u64, max_concurrent_inferences: usize) -> PipelineSettings {
    PipelineSettings {
        capture_size: Resolution::new(WIDTH, HEIGHT),
        warmup: WarmupPolicy {
            attempts: 3,
            backoff: Duration::from_millis(1),
        },
        capture: CaptureSettings {
            target_fps: None,
            read_backoff: Duration::from_millis(1),
        },
        scheduler: SchedulerConfig {
            detection_interval,
            max_concurrent_inferences,
        },
        stream: StreamSettings {
            fps: 0,
            poll_interval: Duration::from_millis(1),
            ..StreamSettings::default()
        },
        jpeg_quality: 75,
    }
}

/// Poll `condition` until it holds, panicking with `what` after five seconds.
pub fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}
