//! Operator-adjustable settings shared between the control thread and the capture worker.
//!
//! The capture worker takes one snapshot per frame, so a change made mid-frame applies
//! from the next frame on and a frame is never processed with half-updated settings.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use crate::Category;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineSettings {
    /// Categories whose detectors run on each frame.
    pub active: BTreeSet<Category>,
    /// Alert email recipient; empty disables email.
    pub email_recipient: String,
    pub sound_enabled: bool,
    /// Human label of the current source ("Webcam 0", a file name, ...).
    pub source_label: String,
}

impl PipelineSettings {
    pub fn is_active(&self, category: Category) -> bool {
        self.active.contains(&category)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<PipelineSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    /// Current settings. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<PipelineSettings> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the settings with an edited copy.
    pub fn update<F>(&self, edit: F)
    where
        F: FnOnce(&mut PipelineSettings),
    {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = PipelineSettings::clone(&guard);
        edit(&mut next);
        *guard = Arc::new(next);
    }
}
