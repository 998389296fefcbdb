//! Registered cameras.
//!
//! The registry is populated once at startup from discovery output. Each
//! device that opens and delivers a warm-up frame becomes a `Camera` with the
//! next dense logical index (0, 1, 2, ...), independent of the device's native
//! index. Devices that fail are released and left out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::error::CameraError;
use crate::frame::Resolution;
use crate::ingest::FrameSource;
use crate::slot::FrameSlot;

pub const DEFAULT_WARMUP_ATTEMPTS: u32 = 5;
pub const DEFAULT_WARMUP_BACKOFF: Duration = Duration::from_millis(50);

/// How hard registration tries to get a first frame out of a device.
#[derive(Clone, Copy, Debug)]
pub struct WarmupPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for WarmupPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_WARMUP_ATTEMPTS,
            backoff: DEFAULT_WARMUP_BACKOFF,
        }
    }
}

#[derive(Debug, Default)]
struct CameraCounters {
    read_failures: AtomicU64,
    inferences_submitted: AtomicU64,
    inferences_skipped: AtomicU64,
    inferences_dropped: AtomicU64,
}

/// One registered camera.
pub struct Camera {
    index: usize,
    label: String,
    resolution: Resolution,
    slot: FrameSlot,
    frame_counter: AtomicU64,
    /// Held until the capture loop takes it; dropped (released) when capture stops.
    device: Mutex<Option<Box<dyn FrameSource>>>,
    inference_in_flight: AtomicBool,
    counters: CameraCounters,
}

/// Point-in-time counters for one camera.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CameraStats {
    pub index: usize,
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub frames_captured: u64,
    pub read_failures: u64,
    pub inferences_submitted: u64,
    pub inferences_skipped_in_flight: u64,
    pub inferences_dropped_saturated: u64,
    pub inference_in_flight: bool,
    pub latest_frame_id: Option<u64>,
    pub latest_detection_frame_id: Option<u64>,
}

/// Listing entry for the query API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CameraInfo {
    pub index: usize,
    pub label: String,
}

impl Camera {
    fn new(index: usize, label: String, resolution: Resolution, device: Box<dyn FrameSource>) -> Self {
        Self {
            index,
            label,
            resolution,
            slot: FrameSlot::new(),
            frame_counter: AtomicU64::new(0),
            device: Mutex::new(Some(device)),
            inference_in_flight: AtomicBool::new(false),
            counters: CameraCounters::default(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Capture resolution, fixed at open time.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }

    pub fn info(&self) -> CameraInfo {
        CameraInfo {
            index: self.index,
            label: self.label.clone(),
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_counter.load(Ordering::Acquire)
    }

    pub fn read_failures(&self) -> u64 {
        self.counters.read_failures.load(Ordering::Relaxed)
    }

    pub fn inferences_submitted(&self) -> u64 {
        self.counters.inferences_submitted.load(Ordering::Relaxed)
    }

    pub fn inference_in_flight(&self) -> bool {
        self.inference_in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> CameraStats {
        CameraStats {
            index: self.index,
            label: self.label.clone(),
            width: self.resolution.width,
            height: self.resolution.height,
            frames_captured: self.frames_captured(),
            read_failures: self.read_failures(),
            inferences_submitted: self.inferences_submitted(),
            inferences_skipped_in_flight: self.counters.inferences_skipped.load(Ordering::Relaxed),
            inferences_dropped_saturated: self.counters.inferences_dropped.load(Ordering::Relaxed),
            inference_in_flight: self.inference_in_flight(),
            latest_frame_id: self.slot.latest_frame_id(),
            latest_detection_frame_id: self.slot.latest_detection_frame_id(),
        }
    }

    /// Advance the frame counter. Only the camera's capture loop calls this.
    pub(crate) fn next_frame_id(&self) -> u64 {
        self.frame_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn record_read_failure(&self) -> u64 {
        self.counters.read_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Atomically claim the camera's single inference slot.
    pub(crate) fn try_begin_inference(&self) -> bool {
        self.inference_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish_inference(&self) {
        self.inference_in_flight.store(false, Ordering::Release);
    }

    pub(crate) fn record_submitted(&self) {
        self.counters.inferences_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.counters.inferences_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.counters.inferences_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Hand the device to a capture loop. Returns `None` if already taken.
    pub(crate) fn take_device(&self) -> Option<Box<dyn FrameSource>> {
        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        // Registered but never captured.
        let device = self
            .device
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut device) = device {
            device.release();
        }
    }
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("index", &self.index)
            .field("label", &self.label)
            .field("resolution", &self.resolution)
            .field("frames_captured", &self.frames_captured())
            .finish()
    }
}

/// Cameras keyed by dense logical index, in registration order.
#[derive(Debug, Default)]
pub struct CameraRegistry {
    cameras: Vec<Arc<Camera>>,
    warmup: WarmupPolicy,
}

impl CameraRegistry {
    pub fn new(warmup: WarmupPolicy) -> Self {
        Self {
            cameras: Vec::new(),
            warmup,
        }
    }

    /// Open a device, warm it up and register it under the next index.
    ///
    /// Fails with `DeviceUnavailable` when the device does not open or no
    /// warm-up read succeeds within the policy's attempts. The device is
    /// released before the error is returned. Warm-up frames are discarded.
    pub fn register(
        &mut self,
        mut source: Box<dyn FrameSource>,
        width: u32,
        height: u32,
    ) -> Result<Arc<Camera>, CameraError> {
        let label = source.label().to_string();
        let resolution = match source.open(width, height) {
            Ok(resolution) => resolution,
            Err(err) => {
                source.release();
                return Err(CameraError::unavailable(label, format!("{err:#}")));
            }
        };

        if let Err(err) = self.warm_up(source.as_mut()) {
            source.release();
            return Err(CameraError::unavailable(label, err));
        }

        let index = self.cameras.len();
        let camera = Arc::new(Camera::new(index, label, resolution, source));
        log::info!(
            "camera registry: camera {} -> {} ({})",
            index,
            camera.label(),
            resolution
        );
        self.cameras.push(camera.clone());
        Ok(camera)
    }

    /// Register every source, logging and skipping the ones that fail.
    /// Returns the number registered.
    pub fn register_all(
        &mut self,
        sources: Vec<Box<dyn FrameSource>>,
        width: u32,
        height: u32,
    ) -> usize {
        let before = self.cameras.len();
        for source in sources {
            if let Err(err) = self.register(source, width, height) {
                log::warn!("camera registry: {}", err);
            }
        }
        self.cameras.len() - before
    }

    fn warm_up(&self, source: &mut dyn FrameSource) -> Result<(), CameraError> {
        let attempts = self.warmup.attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match source.next_frame() {
                Ok(_) => return Ok(()),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log::debug!(
                        "camera registry: warm-up read {}/{} on {} failed: {}",
                        attempt,
                        attempts,
                        source.label(),
                        err
                    );
                    last_err = Some(err);
                    if attempt < attempts {
                        std::thread::sleep(self.warmup.backoff);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CameraError::transient("no warm-up frame")))
    }

    pub fn get(&self, index: usize) -> Result<Arc<Camera>, CameraError> {
        self.cameras
            .get(index)
            .cloned()
            .ok_or(CameraError::NotFound(index))
    }

    /// Cameras in registration order.
    pub fn list(&self) -> &[Arc<Camera>] {
        &self.cameras
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}
