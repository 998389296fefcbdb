use anyhow::Result;

use crate::detect::backend::Detector;
use crate::frame::{DetectionSet, Frame};

/// Detector that never reports anything. Used when no model is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDetector;

impl NullDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Detector for NullDetector {
    fn name(&self) -> &'static str {
        "null"
    }

    fn detect(&self, _frame: &Frame) -> Result<DetectionSet> {
        Ok(DetectionSet::empty())
    }
}
