//! Watchpost
//!
//! Frame-processing and alerting pipeline for multi-model video surveillance.
//!
//! # Architecture
//!
//! A single capture worker drives every frame through the pipeline:
//!
//! 1. **Capture**: a `VideoSource` (camera or file) yields frames on the capture thread.
//! 2. **Detect**: every active category's `Detector` runs on the frame, results are filtered
//!    by the category's confidence threshold and drawn onto two independent copies
//!    (display and email).
//! 3. **Alert**: the first accepted detection of an alerting category within a suppression
//!    window fires the `AlertCoordinator` (sound, detection log, snapshot, email job).
//! 4. **Publish**: annotated frames, detection labels, FPS and progress flow to the consumer
//!    through coalescing channels that never block the producer.
//!
//! # Module Structure
//!
//! - `detect`: detector trait, results, backends, and the background `ModelRegistry`
//! - `ingest`: video sources (synthetic, image sequences, FFmpeg files, V4L2 cameras)
//! - `processor`: per-frame multi-model dispatch and alert triggering
//! - `alert`: alert flags, suppression timer, sound cues, email worker
//! - `logbook`: durable CSV detection/email logs with an in-memory mirror
//! - `capture`: the capture loop state machine
//! - `publish`: coalescing latest-value channels from the capture worker
//! - `pipeline`: coordination-thread facade over all of the above

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;

pub mod alert;
pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod logbook;
pub mod pipeline;
pub mod processor;
pub mod publish;
pub mod settings;

pub use alert::{
    AlertCoordinator, AlertEmail, AlertFlags, EmailDispatcher, EmailJob, MailTransport,
    SilentSound, SmtpMailer, SoundCue, SuppressionTimer,
};
pub use capture::{CaptureLoop, CaptureOptions, CaptureState, CaptureUpdates};
pub use config::{DetectionMode, WatchpostConfig};
pub use detect::{
    BackendFactory, BoundingBox, DetectionResult, Detector, DetectorFactory, LoadEvent,
    LoadState, ModelLoadHandle, ModelRegistry, ModelSet, StubDetector,
};
pub use error::PipelineError;
pub use frame::{Annotator, Frame};
pub use ingest::{SourceFactory, SourceInfo, SourceOptions, VideoSource, VideoSourceHandle};
pub use logbook::{DetectionLogEntry, EmailLogEntry, EmailStatus, Logbook};
pub use pipeline::{Pipeline, PipelineParts};
pub use processor::{FrameProcessor, ProcessedFrame, RunGate};
pub use settings::{PipelineSettings, SettingsHandle};

// -------------------- Categories --------------------

/// Detection domain served by one detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Weapon,
    Fire,
    Accident,
    Object,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Weapon,
        Category::Fire,
        Category::Accident,
        Category::Object,
    ];

    /// Order in which detectors run on a frame.
    pub const PROCESSING_ORDER: [Category; 4] = [
        Category::Fire,
        Category::Accident,
        Category::Weapon,
        Category::Object,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Weapon => "weapon",
            Category::Fire => "fire",
            Category::Accident => "accident",
            Category::Object => "object",
        }
    }

    /// Capitalised name used in log rows and email subjects.
    pub fn display_name(self) -> &'static str {
        match self {
            Category::Weapon => "Weapon",
            Category::Fire => "Fire",
            Category::Accident => "Accident",
            Category::Object => "Object",
        }
    }

    /// Generic object detection is informational only and never alerts.
    pub fn raises_alerts(self) -> bool {
        !matches!(self, Category::Object)
    }

    pub fn threshold(self) -> ConfidenceThreshold {
        match self {
            Category::Weapon => ConfidenceThreshold::AtLeast(0.4),
            Category::Fire | Category::Accident => ConfidenceThreshold::Above(0.5),
            Category::Object => ConfidenceThreshold::AcceptAll,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "weapon" => Ok(Category::Weapon),
            "fire" => Ok(Category::Fire),
            "accident" => Ok(Category::Accident),
            "object" => Ok(Category::Object),
            other => Err(anyhow!("unknown detection category '{}'", other)),
        }
    }
}

/// Acceptance rule applied to a detector's confidence scores.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConfidenceThreshold {
    /// Accept when `confidence >= value`.
    AtLeast(f32),
    /// Accept when `confidence > value`.
    Above(f32),
    AcceptAll,
}

impl ConfidenceThreshold {
    pub fn accepts(self, confidence: f32) -> bool {
        match self {
            ConfidenceThreshold::AtLeast(min) => confidence >= min,
            ConfidenceThreshold::Above(min) => confidence > min,
            ConfidenceThreshold::AcceptAll => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_use_documented_operators_at_the_boundary() {
        assert!(Category::Weapon.threshold().accepts(0.4));
        assert!(!Category::Weapon.threshold().accepts(0.399));
        assert!(!Category::Fire.threshold().accepts(0.5));
        assert!(Category::Fire.threshold().accepts(0.501));
        assert!(!Category::Accident.threshold().accepts(0.5));
        assert!(Category::Object.threshold().accepts(0.0));
    }

    #[test]
    fn only_object_is_silent() {
        let alerting: Vec<_> = Category::ALL
            .into_iter()
            .filter(|c| c.raises_alerts())
            .collect();
        assert_eq!(
            alerting,
            vec![Category::Weapon, Category::Fire, Category::Accident]
        );
    }

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!("Fire".parse::<Category>().unwrap(), Category::Fire);
        assert_eq!(" WEAPON ".parse::<Category>().unwrap(), Category::Weapon);
        assert!("smoke".parse::<Category>().is_err());
    }
}
