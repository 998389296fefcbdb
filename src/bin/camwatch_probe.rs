//! camwatch_probe - list video devices and check which ones deliver frames
//!
//! For every `/dev/video*` node (or every `--device` given) this opens the
//! device, tries to read a first frame and reports the result. Nothing is
//! kept open afterwards.

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::time::Duration;

use camwatch::ingest::{probe_video_devices, source_for_spec};
use camwatch::registry::{CameraRegistry, WarmupPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about = "Probe video devices for usable cameras")]
struct Args {
    /// Device specs to check instead of scanning /dev/video*.
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Requested capture width.
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Requested capture height.
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Reads attempted before a device counts as unusable.
    #[arg(long, default_value_t = 5)]
    attempts: u32,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    device: String,
    name: Option<String>,
    usable: bool,
    resolution: Option<String>,
    error: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let candidates: Vec<(String, Option<String>)> = if args.devices.is_empty() {
        probe_video_devices()?
            .into_iter()
            .map(|dev| (dev.path.display().to_string(), Some(dev.name)))
            .collect()
    } else {
        args.devices.iter().map(|spec| (spec.clone(), None)).collect()
    };

    let policy = WarmupPolicy {
        attempts: args.attempts,
        backoff: Duration::from_millis(50),
    };
    let mut reports = Vec::with_capacity(candidates.len());
    for (device, name) in candidates {
        reports.push(probe_one(&device, name, policy, args.width, args.height));
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }
    if reports.is_empty() {
        println!("no video devices found");
    }
    for report in &reports {
        let name = report.name.as_deref().unwrap_or("-");
        match (&report.resolution, &report.error) {
            (Some(res), _) => println!("{:<16} {:<24} ok {}", report.device, name, res),
            (None, Some(err)) => println!("{:<16} {:<24} unusable: {}", report.device, name, err),
            (None, None) => println!("{:<16} {:<24} unusable", report.device, name),
        }
    }
    let usable = reports.iter().filter(|r| r.usable).count();
    println!("{} usable camera(s)", usable);
    Ok(())
}

/// Register into a throwaway registry so the check matches daemon startup.
fn probe_one(
    device: &str,
    name: Option<String>,
    policy: WarmupPolicy,
    width: u32,
    height: u32,
) -> ProbeReport {
    let mut report = ProbeReport {
        device: device.to_string(),
        name,
        usable: false,
        resolution: None,
        error: None,
    };
    let source = match source_for_spec(device) {
        Ok(source) => source,
        Err(err) => {
            report.error = Some(format!("{err:#}"));
            return report;
        }
    };
    let mut registry = CameraRegistry::new(policy);
    match registry.register(source, width, height) {
        Ok(camera) => {
            report.usable = true;
            report.resolution = Some(camera.resolution().to_string());
        }
        Err(err) => report.error = Some(err.to_string()),
    }
    report
}
