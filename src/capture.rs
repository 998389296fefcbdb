//! Per-camera capture loop.
//!
//! One loop per registered camera, each on its own thread. An iteration reads
//! a frame, publishes it to the camera's slot and offers it to the inference
//! scheduler. Transient read failures are retried forever with a short
//! backoff; only a lost device or the shutdown flag stops the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::error::CameraError;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::registry::Camera;
use crate::scheduler::InferenceScheduler;

pub const DEFAULT_CAPTURE_FPS: u32 = 30;
pub const DEFAULT_READ_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Upper bound on the loop rate. `None` reads as fast as the device delivers.
    pub target_fps: Option<u32>,
    /// Sleep after a failed read.
    pub read_backoff: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            target_fps: Some(DEFAULT_CAPTURE_FPS),
            read_backoff: DEFAULT_READ_BACKOFF,
        }
    }
}

impl CaptureSettings {
    fn frame_interval(&self) -> Option<Duration> {
        match self.target_fps {
            Some(fps) if fps > 0 => Some(Duration::from_secs_f64(1.0 / fps as f64)),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureState {
    Reading,
    Publishing,
    Considering,
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Shutdown,
    DeviceLost,
}

/// Summary returned when a capture loop ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CaptureExit {
    pub camera: usize,
    pub reason: StopReason,
    pub frames_captured: u64,
    pub read_failures: u64,
}

pub struct CaptureLoop {
    camera: Arc<Camera>,
    source: Box<dyn FrameSource>,
    scheduler: InferenceScheduler,
    settings: CaptureSettings,
    shutdown: Arc<AtomicBool>,
    state: CaptureState,
    stop_reason: Option<StopReason>,
    failure_streak: u64,
}

impl CaptureLoop {
    /// Take ownership of the camera's device. Fails if another loop already has it.
    pub fn new(
        camera: Arc<Camera>,
        scheduler: InferenceScheduler,
        settings: CaptureSettings,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let source = camera
            .take_device()
            .ok_or_else(|| anyhow!("camera {} is already being captured", camera.index()))?;
        Ok(Self {
            camera,
            source,
            scheduler,
            settings,
            shutdown,
            state: CaptureState::Reading,
            stop_reason: None,
            failure_streak: 0,
        })
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn camera(&self) -> &Arc<Camera> {
        &self.camera
    }

    /// Run one iteration and return the state it ends in (`Reading` or `Stopped`).
    pub fn step(&mut self) -> CaptureState {
        if self.state == CaptureState::Stopped {
            return CaptureState::Stopped;
        }
        if self.shutdown.load(Ordering::Acquire) {
            self.stop(StopReason::Shutdown);
            return self.state;
        }

        let started = Instant::now();
        self.state = CaptureState::Reading;
        let image = match self.source.next_frame() {
            Ok(image) => image,
            Err(err) => {
                self.on_read_failure(err);
                return self.state;
            }
        };
        if self.failure_streak > 0 {
            log::info!(
                "CaptureLoop[{}]: reads recovered after {} failure(s)",
                self.camera.index(),
                self.failure_streak
            );
            self.failure_streak = 0;
        }

        self.state = CaptureState::Publishing;
        let frame = Frame::new(self.camera.next_frame_id(), image);
        self.camera.slot().publish_frame(frame.clone());

        self.state = CaptureState::Considering;
        self.scheduler.consider(&self.camera, &frame);

        self.state = CaptureState::Reading;
        self.pace(started);
        self.state
    }

    fn on_read_failure(&mut self, err: CameraError) {
        self.camera.record_read_failure();
        if err.is_fatal() {
            log::error!("CaptureLoop[{}]: {}", self.camera.index(), err);
            self.stop(StopReason::DeviceLost);
            return;
        }
        if self.failure_streak == 0 {
            log::warn!(
                "CaptureLoop[{}]: read failed, retrying every {:?}: {}",
                self.camera.index(),
                self.settings.read_backoff,
                err
            );
        }
        self.failure_streak += 1;
        thread::sleep(self.settings.read_backoff);
    }

    /// Idle for the rest of the frame interval. Never skips a read.
    fn pace(&self, started: Instant) {
        if let Some(interval) = self.settings.frame_interval() {
            let elapsed = started.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
    }

    fn stop(&mut self, reason: StopReason) {
        self.source.release();
        self.state = CaptureState::Stopped;
        self.stop_reason = Some(reason);
        log::info!(
            "CaptureLoop[{}]: stopped ({:?}) after {} frame(s), {} read failure(s)",
            self.camera.index(),
            reason,
            self.camera.frames_captured(),
            self.camera.read_failures()
        );
    }

    fn exit(&self) -> CaptureExit {
        CaptureExit {
            camera: self.camera.index(),
            reason: self.stop_reason.unwrap_or(StopReason::Shutdown),
            frames_captured: self.camera.frames_captured(),
            read_failures: self.camera.read_failures(),
        }
    }

    /// Loop until stopped.
    pub fn run(mut self) -> CaptureExit {
        log::info!(
            "CaptureLoop[{}]: capturing {} at {}",
            self.camera.index(),
            self.camera.label(),
            self.camera.resolution()
        );
        while self.step() != CaptureState::Stopped {}
        self.exit()
    }

    /// Run on a dedicated `capture-<index>` thread.
    pub fn spawn(self) -> Result<CaptureHandle> {
        let camera = self.camera.index();
        let handle = thread::Builder::new()
            .name(format!("capture-{camera}"))
            .spawn(move || self.run())
            .with_context(|| format!("failed to spawn capture thread for camera {camera}"))?;
        Ok(CaptureHandle { camera, handle })
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        if self.state != CaptureState::Stopped {
            self.source.release();
        }
    }
}

pub struct CaptureHandle {
    camera: usize,
    handle: JoinHandle<CaptureExit>,
}

impl CaptureHandle {
    pub fn camera(&self) -> usize {
        self.camera
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<CaptureExit> {
        self.handle
            .join()
            .map_err(|_| anyhow!("capture thread for camera {} panicked", self.camera))
    }
}
