use anyhow::{anyhow, Result};

use crate::detect::backend::Detector;
use crate::detect::result::{BoundingBox, DetectionResult};
use crate::frame::Frame;
use crate::Category;

type DetectFn = Box<dyn FnMut(&Frame) -> Result<Vec<DetectionResult>> + Send>;

/// Stub detector for tests and synthetic runs.
///
/// Behaviour is a closure over the incoming frame, so callers can script constant,
/// failing, or frame-dependent outputs without a model runtime.
pub struct StubDetector {
    category: Category,
    detect_fn: DetectFn,
}

impl StubDetector {
    pub fn from_fn<F>(category: Category, detect_fn: F) -> Self
    where
        F: FnMut(&Frame) -> Result<Vec<DetectionResult>> + Send + 'static,
    {
        Self {
            category,
            detect_fn: Box::new(detect_fn),
        }
    }

    /// Never reports anything.
    pub fn empty(category: Category) -> Self {
        Self::from_fn(category, |_| Ok(Vec::new()))
    }

    /// Reports the same detections on every frame.
    pub fn constant(category: Category, detections: Vec<DetectionResult>) -> Self {
        Self::from_fn(category, move |_| Ok(detections.clone()))
    }

    /// Fails every invocation with `reason`.
    pub fn failing(category: Category, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::from_fn(category, move |_| Err(anyhow!("{}", reason)))
    }

    /// One centred, high-confidence detection per frame.
    pub fn always(category: Category) -> Self {
        Self::from_fn(category, move |frame| {
            let (w, h) = (frame.width() as f32, frame.height() as f32);
            Ok(vec![DetectionResult::new(
                category,
                category.display_name(),
                0.9,
                BoundingBox::new(w * 0.25, h * 0.25, w * 0.75, h * 0.75),
            )])
        })
    }

    /// Resolve a `stub://<behaviour>` model path.
    ///
    /// Supported behaviours: `empty`, `always`, `fail`.
    pub fn from_uri(category: Category, uri: &str) -> Result<Self> {
        let behaviour = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a stub model path: {}", uri))?;
        match behaviour {
            "" | "empty" => Ok(Self::empty(category)),
            "always" => Ok(Self::always(category)),
            "fail" => Ok(Self::failing(category, "stub detector configured to fail")),
            other => Err(anyhow!("unknown stub detector behaviour '{}'", other)),
        }
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn category(&self) -> Category {
        self.category
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionResult>> {
        (self.detect_fn)(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn always_reports_a_centred_box() -> Result<()> {
        let mut detector = StubDetector::from_uri(Category::Fire, "stub://always")?;
        let frame = Frame::new(RgbImage::new(100, 40), 0);

        let results = detector.detect(&frame)?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].label, "Fire");
        assert_eq!(results[0].bbox, BoundingBox::new(25.0, 10.0, 75.0, 30.0));
        Ok(())
    }

    #[test]
    fn failing_stub_returns_error() {
        let mut detector = StubDetector::failing(Category::Weapon, "boom");
        let frame = Frame::new(RgbImage::new(4, 4), 0);
        let err = detector.detect(&frame).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn unknown_behaviour_is_rejected() {
        assert!(StubDetector::from_uri(Category::Object, "stub://explode").is_err());
        assert!(StubDetector::from_uri(Category::Object, "/models/object.onnx").is_err());
    }
}
