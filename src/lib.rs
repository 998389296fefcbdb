//! camwatch: multi-camera capture with scheduled object detection.
//!
//! # Architecture
//!
//! Every registered camera gets one capture thread that reads frames as fast
//! as the device delivers them and publishes each one into the camera's
//! `FrameSlot` (latest value only, never a queue). Every Nth frame is offered
//! to a small inference pool shared by all cameras; the pool never queues work
//! and never runs two inferences for the same camera at once. Viewers read
//! the slot through independent `StreamReader`s, so a slow viewer only ever
//! sees fewer frames.
//!
//! # Module Structure
//!
//! - `frame`: frames, bounding boxes, detection sets
//! - `slot`: per-camera latest frame and latest detections
//! - `ingest`: frame sources (synthetic, V4L2) and device discovery
//! - `registry`: camera registration and per-camera counters
//! - `detect`: detector capability and backends
//! - `scheduler`: detection cadence and bounded inference pool
//! - `capture`: per-camera capture loop
//! - `stream`: per-viewer encoded frame streams
//! - `pipeline`: startup wiring and the query service
//! - `api`: HTTP transport (JSON queries, MJPEG streams)
//! - `config`: JSON file + environment configuration

pub mod api;
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod slot;
pub mod stream;

pub use capture::{CaptureExit, CaptureHandle, CaptureLoop, CaptureSettings, CaptureState, StopReason};
pub use config::CamwatchConfig;
pub use detect::{Detector, DetectorRegistry, NullDetector};
pub use error::CameraError;
pub use frame::{BoundingBox, Detection, DetectionSet, Frame, Resolution};
pub use ingest::{CameraDiscovery, DeviceListDiscovery, FrameSource};
pub use pipeline::{CameraService, Pipeline, PipelineSettings};
pub use registry::{Camera, CameraInfo, CameraRegistry, CameraStats, WarmupPolicy};
pub use scheduler::{Admission, InferenceScheduler, SchedulerConfig, SchedulerStats};
pub use slot::{FrameSlot, Snapshot};
pub use stream::{EncodedFrame, Encoder, JpegEncoder, StreamReader, StreamSettings};
