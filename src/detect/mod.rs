//! Object detection capability.
//!
//! The pipeline only sees the `Detector` trait. Concrete backends:
//! - `null`: never detects anything (pipeline without a model)
//! - `tract`: YOLOv8-style ONNX model (feature: backend-tract)

mod backend;
mod backends;
pub mod nms;
mod registry;

pub use backend::Detector;
pub use backends::NullDetector;
#[cfg(feature = "backend-tract")]
pub use backends::TractDetector;
pub use registry::DetectorRegistry;
