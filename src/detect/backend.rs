use anyhow::Result;

use crate::frame::{DetectionSet, Frame};

/// Object detector consumed by the inference pool.
///
/// One instance is shared by every pool worker, so `detect` takes `&self` and
/// may run concurrently (up to the pool size). Implementations must treat the
/// frame as read-only and must not retain it past the call.
pub trait Detector: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one frame. Boxes are in the frame's pixel coordinates.
    fn detect(&self, frame: &Frame) -> Result<DetectionSet>;

    /// Optional warm-up hook, called once before the pipeline starts.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
