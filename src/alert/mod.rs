//! Alerting: per-category suppression flags, the alert side effects, and email delivery.
//!
//! `AlertCoordinator::fire` performs the side effects of one alert in a fixed order:
//! sound cue, detection-log row, snapshot file, then the email hand-off. The log row and
//! the snapshot therefore exist before the email worker ever sees the job.

mod email;
mod flags;
pub mod sound;

use std::sync::Arc;

use chrono::Local;

pub use email::{
    deliver, render_body, subject, AlertEmail, EmailDispatcher, EmailJob, MailTransport,
    SmtpMailer, INLINE_IMAGE_CID,
};
pub use flags::{AlertFlags, SuppressionTimer};
pub use sound::{CommandSound, SilentSound, SoundCue, TerminalBell};

use crate::frame::Frame;
use crate::logbook::{DetectionLogEntry, Logbook, TIMESTAMP_FORMAT};
use crate::settings::PipelineSettings;
use crate::Category;

pub struct AlertCoordinator {
    logbook: Arc<Logbook>,
    sound: Box<dyn SoundCue>,
    email: EmailDispatcher,
}

impl AlertCoordinator {
    pub fn new(logbook: Arc<Logbook>, sound: Box<dyn SoundCue>, email: EmailDispatcher) -> Self {
        Self {
            logbook,
            sound,
            email,
        }
    }

    pub fn logbook(&self) -> &Arc<Logbook> {
        &self.logbook
    }

    /// Run the alert side effects for `category` using the email-annotated `frame`.
    ///
    /// Failures are logged and never propagated; the capture loop keeps running.
    pub fn fire(&self, category: Category, frame: &Frame, settings: &PipelineSettings) {
        let now = Local::now();
        let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
        log::warn!(
            "{} detected on {} at {}",
            category.display_name(),
            settings.source_label,
            timestamp
        );

        if settings.sound_enabled {
            if let Err(err) = self.sound.play() {
                log::warn!("alert sound failed: {:#}", err);
            }
        }

        let entry = DetectionLogEntry::alert(category, &now, &settings.source_label);
        if let Err(err) = self.logbook.append_detection(entry) {
            log::error!("{}", err);
        }

        let image_path = self.logbook.snapshot_path(category, &now);
        if let Err(err) = frame.save(&image_path) {
            log::error!("{:#}", err);
        }

        self.email.dispatch(EmailJob {
            category,
            image_path,
            timestamp,
            source: settings.source_label.clone(),
            recipient: settings.email_recipient.clone(),
        });
    }

    /// Drain queued emails and stop the worker.
    pub fn shutdown(&self) {
        self.email.close();
    }
}
