pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use crate::config::ModelSettings;
use crate::detect::backend::{Detector, DetectorFactory};
use crate::Category;

pub use stub::StubDetector;

#[cfg(feature = "backend-tract")]
pub use tract::{OutputLayout, YoloConfig, YoloDetector};

const STUB_SCHEME: &str = "stub://";

/// Default detector factory.
///
/// - `stub://<behaviour>` paths build a `StubDetector` (no file required).
/// - With `backend-tract`, ONNX files build a `YoloDetector`. The fire model is a
///   YOLOv5 export with an objectness column and a 0.5 confidence floor; the other
///   categories are YOLOv8 exports with a 0.25 floor.
#[derive(Clone, Debug)]
pub struct BackendFactory {
    pub input_size: u32,
    pub iou: f32,
    pub class_names: BTreeMap<Category, Vec<String>>,
}

impl Default for BackendFactory {
    fn default() -> Self {
        Self {
            input_size: 640,
            iou: 0.45,
            class_names: BTreeMap::new(),
        }
    }
}

impl BackendFactory {
    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self {
            input_size: settings.input_size,
            iou: settings.iou,
            class_names: settings.class_names.clone(),
        }
    }

    /// Construction-time confidence floor per category.
    pub fn default_confidence(category: Category) -> f32 {
        match category {
            Category::Fire => 0.5,
            _ => 0.25,
        }
    }

    #[cfg(feature = "backend-tract")]
    fn build_model(&self, category: Category, weights: &Path) -> Result<Box<dyn Detector>> {
        let layout = match category {
            Category::Fire => OutputLayout::V5,
            _ => OutputLayout::V8,
        };
        let config = YoloConfig {
            layout,
            input_size: self.input_size,
            confidence: Self::default_confidence(category),
            iou: self.iou,
            class_names: self.class_names.get(&category).cloned().unwrap_or_default(),
        };
        log::info!(
            "loading {:?} model for '{}' from {}",
            layout,
            category,
            weights.display()
        );
        Ok(Box::new(YoloDetector::new(category, weights, config)?))
    }

    #[cfg(not(feature = "backend-tract"))]
    fn build_model(&self, category: Category, weights: &Path) -> Result<Box<dyn Detector>> {
        Err(anyhow::anyhow!(
            "cannot load {} for '{}': built without the backend-tract feature",
            weights.display(),
            category
        ))
    }
}

impl DetectorFactory for BackendFactory {
    fn build(&self, category: Category, weights: &Path) -> Result<Box<dyn Detector>> {
        if self.is_virtual_path(weights) {
            let uri = weights.to_string_lossy();
            return Ok(Box::new(StubDetector::from_uri(category, &uri)?));
        }
        self.build_model(category, weights)
    }

    fn is_virtual_path(&self, weights: &Path) -> bool {
        weights.to_string_lossy().starts_with(STUB_SCHEME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn stub_paths_are_virtual() {
        let factory = BackendFactory::default();
        assert!(factory.is_virtual_path(&PathBuf::from("stub://always")));
        assert!(!factory.is_virtual_path(&PathBuf::from("models/fire.onnx")));
    }

    #[test]
    fn stub_paths_build_stub_detectors() -> Result<()> {
        let factory = BackendFactory::default();
        let detector = factory.build(Category::Accident, Path::new("stub://empty"))?;
        assert_eq!(detector.name(), "stub");
        assert_eq!(detector.category(), Category::Accident);
        Ok(())
    }

    #[test]
    fn fire_uses_stricter_construction_floor() {
        assert_eq!(BackendFactory::default_confidence(Category::Fire), 0.5);
        assert_eq!(BackendFactory::default_confidence(Category::Weapon), 0.25);
    }
}
