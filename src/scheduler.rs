//! Inference scheduling.
//!
//! `InferenceScheduler::consider` is called by every capture loop for every
//! frame. Frames whose id falls on the detection cadence are handed to a fixed
//! pool of worker threads shared by all cameras. Admission never blocks:
//!
//! 1. off-cadence frames are ignored
//! 2. a camera with an inference still in flight skips the tick
//! 3. if every pool slot is taken the tick is dropped (no backlog)
//!
//! Workers publish results straight into the camera's `FrameSlot`. A failed
//! or panicking detector call is logged and discarded.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;

use crate::detect::Detector;
use crate::error::CameraError;
use crate::frame::Frame;
use crate::registry::Camera;

pub const DEFAULT_DETECTION_INTERVAL: u64 = 12;
pub const DEFAULT_MAX_CONCURRENT_INFERENCES: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Run inference on every Nth captured frame of each camera.
    pub detection_interval: u64,
    /// Worker pool size, shared across all cameras.
    pub max_concurrent_inferences: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            detection_interval: DEFAULT_DETECTION_INTERVAL,
            max_concurrent_inferences: DEFAULT_MAX_CONCURRENT_INFERENCES,
        }
    }
}

/// Outcome of `consider` for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    OffCadence,
    Submitted,
    SkippedInFlight,
    DroppedSaturated,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub skipped_in_flight: u64,
    pub dropped_saturated: u64,
    pub completed: u64,
    pub failed: u64,
    /// Highest number of detector calls observed running at once.
    pub peak_concurrency: usize,
}

impl SchedulerStats {
    /// Submitted tasks that have not finished yet.
    pub fn pending(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
    }
}

struct InferenceJob {
    camera: Arc<Camera>,
    frame: Frame,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    skipped_in_flight: AtomicU64,
    dropped_saturated: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

struct Shared {
    detector: Arc<dyn Detector>,
    config: SchedulerConfig,
    /// Admitted tasks not yet finished (queued or executing). Never exceeds the pool size.
    admitted: AtomicUsize,
    executing: AtomicUsize,
    peak: AtomicUsize,
    counters: Counters,
}

impl Shared {
    fn pool_size(&self) -> usize {
        self.config.max_concurrent_inferences
    }

    fn try_acquire_slot(&self) -> bool {
        let max = self.pool_size();
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.admitted.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Cadence gate plus bounded inference pool. Cheap to clone; the pool shuts
/// down once every clone is dropped and the task in hand has finished.
#[derive(Clone)]
pub struct InferenceScheduler {
    shared: Arc<Shared>,
    jobs: Sender<InferenceJob>,
}

impl InferenceScheduler {
    pub fn new(detector: Arc<dyn Detector>, config: SchedulerConfig) -> Result<Self> {
        let config = SchedulerConfig {
            detection_interval: config.detection_interval.max(1),
            max_concurrent_inferences: config.max_concurrent_inferences.max(1),
        };
        let shared = Arc::new(Shared {
            detector,
            config,
            admitted: AtomicUsize::new(0),
            executing: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            counters: Counters::default(),
        });

        let (jobs, queue) = crossbeam_channel::bounded(config.max_concurrent_inferences);
        for n in 0..config.max_concurrent_inferences {
            let queue = queue.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("inference-{n}"))
                .spawn(move || worker_loop(queue, shared))
                .context("failed to spawn inference worker")?;
        }
        log::info!(
            "inference: {} worker(s), detector '{}', every {} frame(s)",
            config.max_concurrent_inferences,
            shared.detector.name(),
            config.detection_interval
        );

        Ok(Self { shared, jobs })
    }

    pub fn config(&self) -> SchedulerConfig {
        self.shared.config
    }

    /// Decide whether this frame gets an inference. Never blocks.
    pub fn consider(&self, camera: &Arc<Camera>, frame: &Frame) -> Admission {
        let shared = &self.shared;
        if frame.id % shared.config.detection_interval != 0 {
            return Admission::OffCadence;
        }

        if !camera.try_begin_inference() {
            camera.record_skipped();
            shared.counters.skipped_in_flight.fetch_add(1, Ordering::Relaxed);
            log::trace!(
                "inference: camera {} frame {} skipped, previous inference in flight",
                camera.index(),
                frame.id
            );
            return Admission::SkippedInFlight;
        }

        if !shared.try_acquire_slot() {
            camera.finish_inference();
            self.record_drop(camera, frame);
            return Admission::DroppedSaturated;
        }

        // Count before sending so a fast worker can never finish an uncounted task.
        shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        let job = InferenceJob {
            camera: camera.clone(),
            frame: frame.clone(),
        };
        match self.jobs.try_send(job) {
            Ok(()) => {
                camera.record_submitted();
                Admission::Submitted
            }
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                shared.counters.submitted.fetch_sub(1, Ordering::Relaxed);
                job.camera.finish_inference();
                shared.release_slot();
                self.record_drop(camera, frame);
                Admission::DroppedSaturated
            }
        }
    }

    fn record_drop(&self, camera: &Camera, frame: &Frame) {
        camera.record_dropped();
        self.shared
            .counters
            .dropped_saturated
            .fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "inference: camera {} frame {} dropped, pool saturated",
            camera.index(),
            frame.id
        );
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            skipped_in_flight: c.skipped_in_flight.load(Ordering::Relaxed),
            dropped_saturated: c.dropped_saturated.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Acquire),
            failed: c.failed.load(Ordering::Acquire),
            peak_concurrency: self.shared.peak.load(Ordering::Acquire),
        }
    }

    /// Wait until no admitted task remains. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.stats().pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }
}

fn worker_loop(queue: Receiver<InferenceJob>, shared: Arc<Shared>) {
    for job in queue.iter() {
        run_job(&shared, job);
    }
    log::debug!(
        "inference: worker {} exiting",
        thread::current().name().unwrap_or("?")
    );
}

fn run_job(shared: &Shared, job: InferenceJob) {
    let InferenceJob { camera, frame } = job;

    let running = shared.executing.fetch_add(1, Ordering::AcqRel) + 1;
    shared.peak.fetch_max(running, Ordering::AcqRel);
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| shared.detector.detect(&frame)));
    shared.executing.fetch_sub(1, Ordering::AcqRel);

    let result = match outcome {
        Ok(Ok(detections)) => Ok(detections),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(payload) => Err(panic_message(payload)),
    };

    let succeeded = match result {
        Ok(detections) => {
            log::debug!(
                "inference: camera {} frame {}: {} detection(s) in {:?}",
                camera.index(),
                frame.id,
                detections.len(),
                started.elapsed()
            );
            for det in detections.iter() {
                log::debug!(
                    "  -> class {} conf {:.2} bbox [{:.1}, {:.1}, {:.1}, {:.1}]",
                    det.class_id,
                    det.confidence,
                    det.bbox.x1,
                    det.bbox.y1,
                    det.bbox.x2,
                    det.bbox.y2
                );
            }
            camera.slot().publish_detections(detections, frame.id);
            true
        }
        Err(reason) => {
            let err = CameraError::InferenceFailure {
                camera: camera.index(),
                frame_id: frame.id,
                reason,
            };
            log::warn!("inference: {}", err);
            false
        }
    };

    camera.finish_inference();
    shared.release_slot();
    let counter = if succeeded {
        &shared.counters.completed
    } else {
        &shared.counters.failed
    };
    counter.fetch_add(1, Ordering::Release);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("detector panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("detector panicked: {msg}")
    } else {
        "detector panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{BoundingBox, Detection, DetectionSet};
    use crate::ingest::{SyntheticConfig, SyntheticSource};
    use crate::registry::{CameraRegistry, WarmupPolicy};
    use anyhow::anyhow;
    use image::RgbImage;
    use std::sync::Mutex;

    struct OneBox;

    impl Detector for OneBox {
        fn name(&self) -> &'static str {
            "one-box"
        }

        fn detect(&self, _frame: &Frame) -> Result<DetectionSet> {
            Ok(DetectionSet::new(vec![Detection::new(
                3,
                0.8,
                BoundingBox::new(1.0, 2.0, 3.0, 4.0),
            )]))
        }
    }

    /// Blocks every call until released.
    struct Gate {
        open: Mutex<bool>,
    }

    impl Detector for Gate {
        fn name(&self) -> &'static str {
            "gate"
        }

        fn detect(&self, _frame: &Frame) -> Result<DetectionSet> {
            while !*self.open.lock().unwrap() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(DetectionSet::empty())
        }
    }

    struct Flaky;

    impl Detector for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn detect(&self, frame: &Frame) -> Result<DetectionSet> {
            match frame.id {
                2 => Err(anyhow!("model exploded")),
                4 => panic!("detector bug"),
                _ => Ok(DetectionSet::empty()),
            }
        }
    }

    fn cameras(n: usize) -> Vec<Arc<Camera>> {
        let mut registry = CameraRegistry::new(WarmupPolicy::default());
        (0..n)
            .map(|i| {
                let mut config = SyntheticConfig::new(&format!("cam{i}"));
                config.native_fps = 0;
                registry
                    .register(Box::new(SyntheticSource::new(config)), 4, 4)
                    .unwrap()
            })
            .collect()
    }

    fn frame(id: u64) -> Frame {
        Frame::new(id, RgbImage::new(4, 4))
    }

    fn config(interval: u64, pool: usize) -> SchedulerConfig {
        SchedulerConfig {
            detection_interval: interval,
            max_concurrent_inferences: pool,
        }
    }

    #[test]
    fn only_cadence_frames_are_submitted() {
        let scheduler = InferenceScheduler::new(Arc::new(OneBox), config(4, 1)).unwrap();
        let camera = cameras(1).remove(0);
        let mut submitted = 0;
        for id in 1..=10 {
            match scheduler.consider(&camera, &frame(id)) {
                Admission::Submitted => submitted += 1,
                Admission::OffCadence => assert_ne!(id % 4, 0),
                other => panic!("unexpected admission {other:?}"),
            }
            assert!(scheduler.wait_idle(Duration::from_secs(5)));
        }
        assert_eq!(submitted, 2);
        assert_eq!(camera.inferences_submitted(), 2);
        assert_eq!(camera.slot().latest_detection_frame_id(), Some(8));
        assert_eq!(scheduler.stats().completed, 2);
    }

    #[test]
    fn second_tick_for_busy_camera_is_skipped() {
        let gate = Arc::new(Gate {
            open: Mutex::new(false),
        });
        let scheduler = InferenceScheduler::new(gate.clone(), config(1, 2)).unwrap();
        let camera = cameras(1).remove(0);

        assert_eq!(scheduler.consider(&camera, &frame(1)), Admission::Submitted);
        assert_eq!(
            scheduler.consider(&camera, &frame(2)),
            Admission::SkippedInFlight
        );
        *gate.open.lock().unwrap() = true;
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        assert_eq!(scheduler.consider(&camera, &frame(3)), Admission::Submitted);
        assert!(scheduler.wait_idle(Duration::from_secs(5)));

        let stats = scheduler.stats();
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.skipped_in_flight, 1);
        assert_eq!(camera.stats().inferences_skipped_in_flight, 1);
    }

    #[test]
    fn saturated_pool_drops_instead_of_queueing() {
        let gate = Arc::new(Gate {
            open: Mutex::new(false),
        });
        let scheduler = InferenceScheduler::new(gate.clone(), config(1, 2)).unwrap();
        let cams = cameras(4);

        let admissions: Vec<Admission> = cams
            .iter()
            .map(|camera| scheduler.consider(camera, &frame(1)))
            .collect();
        assert_eq!(
            admissions,
            vec![
                Admission::Submitted,
                Admission::Submitted,
                Admission::DroppedSaturated,
                Admission::DroppedSaturated,
            ]
        );
        // A dropped tick leaves the camera free for its next tick.
        assert!(!cams[2].inference_in_flight());

        *gate.open.lock().unwrap() = true;
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        let stats = scheduler.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.dropped_saturated, 2);
        assert!(stats.peak_concurrency <= 2);
    }

    #[test]
    fn failures_and_panics_do_not_block_later_ticks() {
        let scheduler = InferenceScheduler::new(Arc::new(Flaky), config(1, 1)).unwrap();
        let camera = cameras(1).remove(0);
        for id in 1..=5 {
            assert_eq!(scheduler.consider(&camera, &frame(id)), Admission::Submitted);
            assert!(scheduler.wait_idle(Duration::from_secs(5)));
        }
        let stats = scheduler.stats();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 2);
        assert_eq!(camera.slot().latest_detection_frame_id(), Some(5));
        assert!(!camera.inference_in_flight());
    }
}
