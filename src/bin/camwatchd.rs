//! camwatchd - multi-camera capture and detection daemon
//!
//! This daemon:
//! 1. Registers every camera that opens and delivers a first frame
//! 2. Captures each camera on its own thread into a latest-frame slot
//! 3. Runs the configured detector on every Nth frame, bounded pool
//! 4. Serves MJPEG streams and detection JSON over HTTP

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use camwatch::{
    api::{ApiConfig, ApiServer},
    CamwatchConfig, Detector, DetectorRegistry, DeviceListDiscovery, Pipeline,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera capture, detection and streaming daemon")]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "CAMWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging, including every detection.
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = CamwatchConfig::load_from(args.config.as_deref())?;
    let debug = args.debug || config.debug;
    let default_filter = if debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let detector = build_detector(&config)?;
    let discovery = DeviceListDiscovery::new(config.devices.clone(), config.max_devices);
    let pipeline = Pipeline::start(&config, &discovery, detector)?;
    let service = pipeline.service();
    for camera in service.list_cameras() {
        log::info!("camera {}: {}", camera.index, camera.label);
    }

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, service.clone()).spawn()?;
    log::info!(
        "camwatchd running: {} camera(s), detector '{}', api on {}",
        service.camera_count(),
        config.inference.backend,
        api_handle.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("camwatchd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    api_handle.stop()?;
    for exit in pipeline.shutdown()? {
        log::info!(
            "camera {} stopped ({:?}): {} frame(s), {} read failure(s)",
            exit.camera,
            exit.reason,
            exit.frames_captured,
            exit.read_failures
        );
    }
    let stats = service.scheduler_stats();
    log::info!(
        "inference: {} submitted, {} completed, {} failed, {} skipped in flight, {} dropped",
        stats.submitted,
        stats.completed,
        stats.failed,
        stats.skipped_in_flight,
        stats.dropped_saturated
    );

    Ok(())
}

fn build_detector(config: &CamwatchConfig) -> Result<Arc<dyn Detector>> {
    #[allow(unused_mut)]
    let mut registry = DetectorRegistry::with_builtin();

    #[cfg(feature = "backend-tract")]
    if let Some(path) = &config.inference.model_path {
        let detector = camwatch::detect::TractDetector::new(path, config.inference.input_size)?
            .with_thresholds(config.inference.confidence, config.inference.iou);
        registry.register(detector);
    }
    #[cfg(not(feature = "backend-tract"))]
    if config.inference.model_path.is_some() {
        log::warn!("model_path is set but this build has no backend-tract feature");
    }

    registry.select(&config.inference.backend)
}
