use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::Detector;

/// Named detector backends. The first registered backend becomes the default.
pub struct DetectorRegistry {
    detectors: BTreeMap<String, Arc<dyn Detector>>,
    default_name: Option<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            detectors: BTreeMap::new(),
            default_name: None,
        }
    }

    /// Registry with every backend compiled into this build that needs no
    /// external resources.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(super::NullDetector::new());
        registry
    }

    pub fn register<D: Detector + 'static>(&mut self, detector: D) {
        self.register_shared(Arc::new(detector));
    }

    pub fn register_shared(&mut self, detector: Arc<dyn Detector>) {
        let name = detector.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.detectors.insert(name, detector);
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.detectors.contains_key(name) {
            return Err(anyhow!("detector '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Detector>> {
        self.detectors.get(name).cloned()
    }

    pub fn default_detector(&self) -> Option<Arc<dyn Detector>> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Look up a detector by name, failing with the list of known names.
    pub fn select(&self, name: &str) -> Result<Arc<dyn Detector>> {
        self.get(name).ok_or_else(|| {
            anyhow!(
                "unknown detector backend '{}' (available: {})",
                name,
                self.list().join(", ")
            )
        })
    }

    /// Registered names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.detectors.keys().cloned().collect()
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{DetectionSet, Frame};

    struct Named(&'static str);

    impl Detector for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn detect(&self, _frame: &Frame) -> Result<DetectionSet> {
            Ok(DetectionSet::empty())
        }
    }

    #[test]
    fn first_registered_is_default() {
        let mut registry = DetectorRegistry::new();
        registry.register(Named("a"));
        registry.register(Named("b"));
        assert_eq!(registry.default_detector().unwrap().name(), "a");
        registry.set_default("b").unwrap();
        assert_eq!(registry.default_detector().unwrap().name(), "b");
        assert_eq!(registry.list(), vec!["a", "b"]);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let mut registry = DetectorRegistry::with_builtin();
        assert!(registry.set_default("yolo").is_err());
        let err = registry.select("yolo").err().unwrap().to_string();
        assert!(err.contains("null"), "{err}");
        assert!(registry.select("null").is_ok());
    }
}
