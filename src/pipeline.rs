//! Startup wiring and the query surface used by transports.
//!
//! `Pipeline::start` discovers devices, registers the ones that warm up,
//! starts the inference pool and one capture thread per camera. The
//! `CameraService` it hands out answers the transport-facing queries and is
//! cheap to clone into request handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::capture::{CaptureExit, CaptureHandle, CaptureLoop, CaptureSettings};
use crate::config::CamwatchConfig;
use crate::detect::Detector;
use crate::error::CameraError;
use crate::frame::{DetectionSet, Resolution};
use crate::ingest::CameraDiscovery;
use crate::registry::{Camera, CameraInfo, CameraRegistry, CameraStats, WarmupPolicy};
use crate::scheduler::{InferenceScheduler, SchedulerConfig, SchedulerStats};
use crate::stream::{Encoder, JpegEncoder, StreamReader, StreamSettings};

/// Everything `Pipeline::start_with` needs besides devices and a detector.
#[derive(Clone, Copy, Debug)]
pub struct PipelineSettings {
    /// Requested capture size; devices may negotiate another.
    pub capture_size: Resolution,
    pub warmup: WarmupPolicy,
    pub capture: CaptureSettings,
    pub scheduler: SchedulerConfig,
    pub stream: StreamSettings,
    pub jpeg_quality: u8,
}

impl PipelineSettings {
    pub fn from_config(config: &CamwatchConfig) -> Self {
        Self {
            capture_size: Resolution::new(config.capture.width, config.capture.height),
            warmup: config.warmup_policy(),
            capture: config.capture_settings(),
            scheduler: config.scheduler_config(),
            stream: config.stream_settings(),
            jpeg_quality: config.stream.jpeg_quality,
        }
    }
}

struct ServiceInner {
    registry: CameraRegistry,
    scheduler: InferenceScheduler,
    encoder: Arc<dyn Encoder>,
    stream: StreamSettings,
}

/// Read-only view of the running cameras.
#[derive(Clone)]
pub struct CameraService {
    inner: Arc<ServiceInner>,
}

impl CameraService {
    pub fn new(
        registry: CameraRegistry,
        scheduler: InferenceScheduler,
        encoder: Arc<dyn Encoder>,
        stream: StreamSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                registry,
                scheduler,
                encoder,
                stream,
            }),
        }
    }

    /// Registered cameras in index order.
    pub fn list_cameras(&self) -> Vec<CameraInfo> {
        self.inner
            .registry
            .list()
            .iter()
            .map(|camera| camera.info())
            .collect()
    }

    pub fn camera_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn camera(&self, index: usize) -> Result<Arc<Camera>, CameraError> {
        self.inner.registry.get(index)
    }

    /// A new, independent reader for one camera.
    pub fn open_stream(&self, index: usize) -> Result<StreamReader, CameraError> {
        let camera = self.camera(index)?;
        Ok(StreamReader::new(
            camera,
            self.inner.encoder.clone(),
            self.inner.stream,
        ))
    }

    /// Latest detection set; empty until the first inference completes.
    pub fn get_detections(&self, index: usize) -> Result<Arc<DetectionSet>, CameraError> {
        Ok(self.camera(index)?.slot().latest_detections())
    }

    pub fn camera_stats(&self, index: usize) -> Result<CameraStats, CameraError> {
        Ok(self.camera(index)?.stats())
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.scheduler.stats()
    }

    pub fn scheduler(&self) -> &InferenceScheduler {
        &self.inner.scheduler
    }
}

pub struct Pipeline {
    service: CameraService,
    shutdown: Arc<AtomicBool>,
    captures: Vec<CaptureHandle>,
}

impl Pipeline {
    pub fn start(
        config: &CamwatchConfig,
        discovery: &dyn CameraDiscovery,
        detector: Arc<dyn Detector>,
    ) -> Result<Self> {
        Self::start_with(PipelineSettings::from_config(config), discovery, detector)
    }

    /// Fails with `CameraError::NoCameras` when no device registers.
    pub fn start_with(
        settings: PipelineSettings,
        discovery: &dyn CameraDiscovery,
        detector: Arc<dyn Detector>,
    ) -> Result<Self> {
        let sources = discovery.discover().context("camera discovery failed")?;
        let candidates = sources.len();
        let mut registry = CameraRegistry::new(settings.warmup);
        let registered = registry.register_all(
            sources,
            settings.capture_size.width,
            settings.capture_size.height,
        );
        if registered == 0 {
            return Err(CameraError::NoCameras.into());
        }
        log::info!(
            "pipeline: {} of {} camera(s) registered",
            registered,
            candidates
        );

        detector
            .warm_up()
            .with_context(|| format!("detector '{}' failed to warm up", detector.name()))?;
        let scheduler = InferenceScheduler::new(detector, settings.scheduler)?;

        let encoder: Arc<dyn Encoder> = Arc::new(JpegEncoder::new(settings.jpeg_quality));
        let mut pipeline = Self {
            service: CameraService::new(registry, scheduler, encoder, settings.stream),
            shutdown: Arc::new(AtomicBool::new(false)),
            captures: Vec::new(),
        };
        // On error the pipeline is dropped, which stops the loops already running.
        let cameras = pipeline.service.inner.registry.list().to_vec();
        for camera in cameras {
            pipeline.spawn_capture(camera, settings.capture)?;
        }
        Ok(pipeline)
    }

    fn spawn_capture(&mut self, camera: Arc<Camera>, settings: CaptureSettings) -> Result<()> {
        let capture = CaptureLoop::new(
            camera,
            self.service.inner.scheduler.clone(),
            settings,
            self.shutdown.clone(),
        )?;
        self.captures.push(capture.spawn()?);
        Ok(())
    }

    pub fn service(&self) -> CameraService {
        self.service.clone()
    }

    /// Whether the camera's capture thread is still running.
    pub fn is_capturing(&self, index: usize) -> bool {
        self.captures
            .iter()
            .find(|handle| handle.camera() == index)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop every capture loop and wait for it. In-flight inferences finish
    /// on their own.
    pub fn shutdown(mut self) -> Result<Vec<CaptureExit>> {
        self.stop_captures()
    }

    /// Joins every loop; the first join error is returned after all are joined.
    fn stop_captures(&mut self) -> Result<Vec<CaptureExit>> {
        self.shutdown.store(true, Ordering::Release);
        let mut exits = Vec::with_capacity(self.captures.len());
        let mut first_err = None;
        for handle in self.captures.drain(..) {
            match handle.join() {
                Ok(exit) => exits.push(exit),
                Err(err) => {
                    log::warn!("pipeline: {:#}", err);
                    first_err.get_or_insert(err);
                }
            }
        }
        if !exits.is_empty() {
            log::info!("pipeline: {} capture loop(s) stopped", exits.len());
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(exits),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Join errors were already logged.
        let _ = self.stop_captures();
    }
}
