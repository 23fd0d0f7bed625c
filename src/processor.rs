//! Per-frame multi-model dispatch.
//!
//! Each active category with a loaded detector runs in a fixed order. Its accepted
//! detections are drawn on the display copy and the email copy, and the first accepted
//! detection of an alerting category in a suppression window fires an alert.
//!
//! Processing for a capture run goes through that run's `RunGate`. Once the gate is
//! closed the run can no longer arm flags or fire alerts.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use image::Rgb;

use crate::alert::{AlertCoordinator, AlertFlags};
use crate::detect::{DetectionResult, ModelRegistry};
use crate::error::PipelineError;
use crate::frame::{Annotator, Frame};
use crate::settings::PipelineSettings;
use crate::Category;

/// Output of one processing cycle.
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    /// Frame with overlays for the operator.
    pub display: Frame,
    /// Identically annotated copy used as the email snapshot.
    pub email: Frame,
    /// Labels of every accepted detection, in detection order (may repeat).
    pub labels: Vec<String>,
    /// Categories that fired an alert on this frame.
    pub alerts: Vec<Category>,
}

impl ProcessedFrame {
    /// Deduplicated, sorted labels for display.
    pub fn label_set(&self) -> Vec<String> {
        self.labels
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

pub fn overlay_color(category: Category) -> Rgb<u8> {
    match category {
        Category::Fire => Rgb([255, 0, 0]),
        Category::Accident => Rgb([0, 200, 255]),
        Category::Weapon => Rgb([255, 100, 0]),
        Category::Object => Rgb([0, 255, 0]),
    }
}

/// Text drawn next to a box.
pub fn overlay_label(detection: &DetectionResult) -> String {
    match detection.category {
        Category::Fire | Category::Accident => detection.category.display_name().to_string(),
        Category::Weapon | Category::Object => {
            format!("{} {:.2}", detection.label, detection.confidence)
        }
    }
}

/// Label reported in the aggregated detection list.
fn aggregate_label(detection: &DetectionResult) -> String {
    match detection.category {
        Category::Fire | Category::Accident => detection.category.display_name().to_string(),
        Category::Weapon | Category::Object => detection.label.clone(),
    }
}

/// Open while a capture run is current.
///
/// `close` waits for any work already running under the gate, so nothing from the
/// closed run lands after `close` returns.
#[derive(Debug)]
pub struct RunGate {
    open: Mutex<bool>,
}

impl Default for RunGate {
    fn default() -> Self {
        Self {
            open: Mutex::new(true),
        }
    }
}

impl RunGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        *self.lock() = false;
    }

    pub fn is_open(&self) -> bool {
        *self.lock()
    }

    /// Run `f` only if the gate is open, holding it open until `f` returns.
    pub fn while_open<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let open = self.lock();
        if *open {
            Some(f())
        } else {
            None
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.open.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct FrameProcessor {
    registry: ModelRegistry,
    flags: Arc<AlertFlags>,
    coordinator: Arc<AlertCoordinator>,
    annotator: Annotator,
}

impl FrameProcessor {
    pub fn new(
        registry: ModelRegistry,
        flags: Arc<AlertFlags>,
        coordinator: Arc<AlertCoordinator>,
        annotator: Annotator,
    ) -> Self {
        Self {
            registry,
            flags,
            coordinator,
            annotator,
        }
    }

    pub fn process(&self, frame: &Frame, settings: &PipelineSettings) -> ProcessedFrame {
        self.process_within(frame, settings, &RunGate::new())
    }

    /// Process a frame for the run behind `gate`. Detection continues after the gate
    /// closes, but no alert is raised.
    pub fn process_within(
        &self,
        frame: &Frame,
        settings: &PipelineSettings,
        gate: &RunGate,
    ) -> ProcessedFrame {
        let mut out = ProcessedFrame {
            display: frame.clone(),
            email: frame.clone(),
            labels: Vec::new(),
            alerts: Vec::new(),
        };
        // Never wait for models; an unready registry yields the frame unchanged.
        let Some(models) = self.registry.models() else {
            return out;
        };

        for category in Category::PROCESSING_ORDER {
            if !gate.is_open() {
                break;
            }
            if !settings.is_active(category) || !models.contains(category) {
                continue;
            }
            let detections = match models.detect(category, frame) {
                Ok(detections) => detections,
                Err(err) => {
                    let failure = PipelineError::DetectorInvocationFailure {
                        category,
                        reason: format!("{:#}", err),
                    };
                    log::warn!("{}", failure);
                    continue;
                }
            };

            let threshold = category.threshold();
            let color = overlay_color(category);
            let mut accepted = 0usize;
            for detection in detections
                .iter()
                .filter(|d| threshold.accepts(d.confidence))
            {
                let text = overlay_label(detection);
                self.annotator
                    .draw(&mut out.display, &detection.bbox, &text, color);
                self.annotator
                    .draw(&mut out.email, &detection.bbox, &text, color);
                out.labels.push(aggregate_label(detection));
                accepted += 1;
            }

            if accepted > 0 && category.raises_alerts() {
                let fired = gate.while_open(|| {
                    if self.flags.try_arm(category) {
                        self.coordinator.fire(category, &out.email, settings);
                        true
                    } else {
                        false
                    }
                });
                if fired == Some(true) {
                    out.alerts.push(category);
                }
            }
        }
        out
    }
}
