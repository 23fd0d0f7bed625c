use std::path::Path;

use anyhow::Result;

use crate::detect::result::DetectionResult;
use crate::frame::Frame;
use crate::Category;

/// One pretrained model serving a single detection category.
///
/// Implementations must treat the frame as read-only. Threshold filtering against the
/// category's acceptance rule happens in the frame processor, not here; a detector may
/// still apply its own construction-time confidence floor.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Category this detector reports for.
    fn category(&self) -> Category;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionResult>>;

    /// Optional warm-up hook, run once after construction.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builds the detector for a category from its weight file.
///
/// Construction is polymorphic over the category: different categories may use
/// different model layouts or runtimes.
pub trait DetectorFactory: Send + Sync {
    fn build(&self, category: Category, weights: &Path) -> Result<Box<dyn Detector>>;

    /// Paths this factory resolves without touching the filesystem.
    fn is_virtual_path(&self, _weights: &Path) -> bool {
        false
    }
}
