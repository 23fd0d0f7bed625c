mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{Detector, DetectorFactory};
pub use backends::{BackendFactory, StubDetector};
#[cfg(feature = "backend-tract")]
pub use backends::{OutputLayout, YoloConfig, YoloDetector};
pub use registry::{LoadEvent, LoadState, ModelLoadHandle, ModelRegistry, ModelSet};
pub use result::{BoundingBox, DetectionResult};
