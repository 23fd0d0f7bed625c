use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::detect::backend::{Detector, DetectorFactory};
use crate::detect::result::DetectionResult;
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::Category;

/// Complete set of loaded detectors, keyed by category.
///
/// Detectors are wrapped in `Mutex` because `Detector::detect` takes `&mut self`.
pub struct ModelSet {
    detectors: BTreeMap<Category, Mutex<Box<dyn Detector>>>,
}

impl ModelSet {
    pub fn new(detectors: BTreeMap<Category, Box<dyn Detector>>) -> Self {
        Self {
            detectors: detectors
                .into_iter()
                .map(|(category, detector)| (category, Mutex::new(detector)))
                .collect(),
        }
    }

    pub fn contains(&self, category: Category) -> bool {
        self.detectors.contains_key(&category)
    }

    pub fn categories(&self) -> Vec<Category> {
        self.detectors.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Run the category's detector on a frame.
    ///
    /// A panicking detector is reported as an error for this frame only.
    pub fn detect(&self, category: Category, frame: &Frame) -> Result<Vec<DetectionResult>> {
        let detector = self
            .detectors
            .get(&category)
            .ok_or_else(|| anyhow!("no detector loaded for '{}'", category))?;
        let mut guard = detector
            .lock()
            .map_err(|_| anyhow!("'{}' detector lock poisoned", category))?;
        match panic::catch_unwind(AssertUnwindSafe(|| guard.detect(frame))) {
            Ok(result) => result,
            Err(_) => Err(anyhow!("'{}' detector panicked", category)),
        }
    }
}

/// Published state of the model registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    Ready,
    Failed(String),
}

/// Completion event of a background load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadEvent {
    Ready(Vec<Category>),
    Failed(String),
}

struct RegistryState {
    status: LoadState,
    models: Option<Arc<ModelSet>>,
}

/// Thread-safe holder of the loaded model set.
///
/// Consumers see either the complete set or nothing: models and status are swapped
/// together under one lock when loading finishes.
#[derive(Clone)]
pub struct ModelRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState {
                status: LoadState::Idle,
                models: None,
            })),
        }
    }

    /// Registry that is ready immediately with an already-built set.
    pub fn with_models(models: ModelSet) -> Self {
        let registry = Self::new();
        registry.install(Ok(models));
        registry
    }

    pub fn state(&self) -> LoadState {
        match self.state.read() {
            Ok(guard) => guard.status.clone(),
            Err(poisoned) => poisoned.into_inner().status.clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == LoadState::Ready
    }

    /// Current model set, if loading has completed. Never waits for a load in progress.
    pub fn models(&self) -> Option<Arc<ModelSet>> {
        match self.state.read() {
            Ok(guard) => guard.models.clone(),
            Err(poisoned) => poisoned.into_inner().models.clone(),
        }
    }

    /// Load every configured detector on the calling thread.
    ///
    /// Each weight path must exist unless the factory resolves it virtually. The first
    /// failure aborts the whole load; no partial set is returned.
    pub fn load(
        paths: &BTreeMap<Category, PathBuf>,
        factory: &dyn DetectorFactory,
    ) -> Result<ModelSet, PipelineError> {
        let mut detectors: BTreeMap<Category, Box<dyn Detector>> = BTreeMap::new();
        for (&category, path) in paths {
            if !factory.is_virtual_path(path) && !path.exists() {
                return Err(PipelineError::ModelPathNotFound {
                    category,
                    path: path.clone(),
                });
            }
            let mut detector =
                factory
                    .build(category, path)
                    .map_err(|err| PipelineError::ModelLoadFailure {
                        category,
                        reason: format!("{:#}", err),
                    })?;
            detector
                .warm_up()
                .map_err(|err| PipelineError::ModelLoadFailure {
                    category,
                    reason: format!("warm-up failed: {:#}", err),
                })?;
            log::info!("loaded '{}' detector ({})", category, detector.name());
            detectors.insert(category, detector);
        }
        Ok(ModelSet::new(detectors))
    }

    /// Load on a background thread; the caller is never blocked.
    ///
    /// The returned handle yields exactly one `LoadEvent`.
    pub fn spawn_load(
        &self,
        paths: BTreeMap<Category, PathBuf>,
        factory: Arc<dyn DetectorFactory>,
    ) -> Result<ModelLoadHandle> {
        self.set_status(LoadState::Loading);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let registry = self.clone();
        let join = std::thread::Builder::new()
            .name("model-loader".to_string())
            .spawn(move || {
                log::info!("loading {} detection models", paths.len());
                let event = registry.install(Self::load(&paths, factory.as_ref()));
                let _ = tx.send(event);
            })
            .map_err(|err| {
                self.set_status(LoadState::Failed(err.to_string()));
                anyhow!("failed to spawn model loader: {}", err)
            })?;
        Ok(ModelLoadHandle {
            events: rx,
            join: Some(join),
        })
    }

    fn install(&self, result: Result<ModelSet, PipelineError>) -> LoadEvent {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match result {
            Ok(models) => {
                let categories = models.categories();
                guard.models = Some(Arc::new(models));
                guard.status = LoadState::Ready;
                log::info!("detection models ready: {:?}", categories);
                LoadEvent::Ready(categories)
            }
            Err(err) => {
                let message = format!("Error loading models: {}", err);
                log::error!("{}", message);
                guard.models = None;
                guard.status = LoadState::Failed(message.clone());
                LoadEvent::Failed(message)
            }
        }
    }

    fn set_status(&self, status: LoadState) {
        match self.state.write() {
            Ok(mut guard) => guard.status = status,
            Err(poisoned) => poisoned.into_inner().status = status,
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a background model load.
pub struct ModelLoadHandle {
    events: Receiver<LoadEvent>,
    join: Option<JoinHandle<()>>,
}

impl ModelLoadHandle {
    /// Non-blocking poll for the completion event.
    pub fn try_event(&self) -> Option<LoadEvent> {
        self.events.try_recv().ok()
    }

    /// Wait up to `timeout` for the completion event.
    pub fn wait(&mut self, timeout: Duration) -> Option<LoadEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
                Some(event)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(LoadEvent::Failed("model loader exited without reporting".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::{BackendFactory, StubDetector};
    use image::RgbImage;
    use std::path::Path;

    fn stub_paths(behaviours: &[(Category, &str)]) -> BTreeMap<Category, PathBuf> {
        behaviours
            .iter()
            .map(|(c, b)| (*c, PathBuf::from(format!("stub://{}", b))))
            .collect()
    }

    #[test]
    fn missing_weight_file_aborts_whole_load() {
        let mut paths = stub_paths(&[(Category::Weapon, "always")]);
        paths.insert(Category::Fire, PathBuf::from("/nonexistent/fire.onnx"));

        let err = ModelRegistry::load(&paths, &BackendFactory::default()).err();
        match err {
            Some(PipelineError::ModelPathNotFound { category, path }) => {
                assert_eq!(category, Category::Fire);
                assert_eq!(path, Path::new("/nonexistent/fire.onnx"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn background_load_publishes_complete_set() {
        let registry = ModelRegistry::new();
        assert_eq!(registry.state(), LoadState::Idle);
        let paths = stub_paths(&[(Category::Weapon, "always"), (Category::Object, "empty")]);

        let mut handle = registry
            .spawn_load(paths, Arc::new(BackendFactory::default()))
            .unwrap();
        let event = handle.wait(Duration::from_secs(5));

        assert_eq!(
            event,
            Some(LoadEvent::Ready(vec![Category::Weapon, Category::Object]))
        );
        assert!(registry.is_ready());
        assert_eq!(registry.models().unwrap().len(), 2);
    }

    #[test]
    fn failed_load_exposes_no_models() {
        let registry = ModelRegistry::new();
        let paths = stub_paths(&[(Category::Weapon, "always"), (Category::Fire, "bogus")]);

        let mut handle = registry
            .spawn_load(paths, Arc::new(BackendFactory::default()))
            .unwrap();
        let event = handle.wait(Duration::from_secs(5));

        assert!(matches!(event, Some(LoadEvent::Failed(_))));
        assert!(matches!(registry.state(), LoadState::Failed(_)));
        assert!(registry.models().is_none());
    }

    #[test]
    fn panicking_detector_is_contained() {
        let mut detectors: BTreeMap<Category, Box<dyn Detector>> = BTreeMap::new();
        detectors.insert(
            Category::Fire,
            Box::new(StubDetector::from_fn(Category::Fire, |_| panic!("bad tensor"))),
        );
        let set = ModelSet::new(detectors);
        let frame = Frame::new(RgbImage::new(8, 8), 0);

        assert!(set.detect(Category::Fire, &frame).is_err());
        assert!(set.detect(Category::Fire, &frame).is_err());
        assert!(set.detect(Category::Weapon, &frame).is_err());
    }
}
