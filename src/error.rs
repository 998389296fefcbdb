use thiserror::Error;

/// Conditions the pipeline distinguishes explicitly.
///
/// Everything else (configuration, I/O, model loading, encoding) travels as
/// `anyhow::Error`.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Open or warm-up failed. The device is excluded from the registry.
    #[error("camera device {label} unavailable: {reason}")]
    DeviceUnavailable { label: String, reason: String },

    /// A single read failed. Capture retries it with backoff.
    #[error("transient read failure: {0}")]
    TransientReadFailure(String),

    /// The device is gone for good. Capture stops for this camera only.
    #[error("camera device lost: {0}")]
    DeviceLost(String),

    /// The detector returned an error or panicked for one cadence tick.
    #[error("inference failed on camera {camera} frame {frame_id}: {reason}")]
    InferenceFailure {
        camera: usize,
        frame_id: u64,
        reason: String,
    },

    /// No camera is registered under this index.
    #[error("camera {0} not found")]
    NotFound(usize),

    /// Startup registered zero cameras.
    #[error("no usable cameras registered")]
    NoCameras,
}

impl CameraError {
    pub fn unavailable(label: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::DeviceUnavailable {
            label: label.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transient(reason: impl std::fmt::Display) -> Self {
        Self::TransientReadFailure(reason.to_string())
    }

    /// True when capture must stop instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost(_))
    }
}
