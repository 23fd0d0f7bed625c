//! Coordination-side facade.
//!
//! `Pipeline` owns everything the control thread touches: configuration, the model
//! registry, operator settings, the suppression timer, and the capture loop. The capture
//! worker, email worker, timer, and model loader each run on their own thread; every
//! call here returns without waiting on them, except `stop` (bounded) and `shutdown`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::alert::{
    sound, AlertCoordinator, AlertFlags, EmailDispatcher, MailTransport, SmtpMailer, SoundCue,
    SuppressionTimer,
};
use crate::capture::{CaptureLoop, CaptureOptions, CaptureState, CaptureUpdates};
use crate::config::{DetectionMode, WatchpostConfig};
use crate::detect::{BackendFactory, DetectorFactory, LoadEvent, LoadState, ModelLoadHandle, ModelRegistry};
use crate::error::PipelineError;
use crate::frame::Annotator;
use crate::ingest::{SourceFactory, SourceInfo, SourceOptions, VideoSource, VideoSourceHandle};
use crate::logbook::Logbook;
use crate::processor::FrameProcessor;
use crate::settings::{PipelineSettings, SettingsHandle};
use crate::Category;

/// Replaceable collaborators. `Pipeline::from_config` fills these from configuration.
pub struct PipelineParts {
    pub detectors: Arc<dyn DetectorFactory>,
    pub transport: Arc<dyn MailTransport>,
    pub sound: Box<dyn SoundCue>,
    pub sources: SourceFactory,
}

pub struct Pipeline {
    config: WatchpostConfig,
    registry: ModelRegistry,
    detectors: Arc<dyn DetectorFactory>,
    loader: Option<ModelLoadHandle>,
    logbook: Arc<Logbook>,
    coordinator: Arc<AlertCoordinator>,
    timer: SuppressionTimer,
    settings: SettingsHandle,
    mode: DetectionMode,
    custom_categories: BTreeSet<Category>,
    capture: CaptureLoop,
}

impl Pipeline {
    pub fn from_config(config: WatchpostConfig) -> Result<(Self, CaptureUpdates)> {
        let sound: Box<dyn SoundCue> = sound::from_command(config.alerts.sound_command.as_deref())?;
        let parts = PipelineParts {
            detectors: Arc::new(BackendFactory::from_settings(&config.models)),
            transport: Arc::new(SmtpMailer::new(config.smtp.clone())),
            sound,
            sources: SourceFactory::new(SourceOptions::from_settings(&config.capture)),
        };
        Self::new(config, parts)
    }

    pub fn new(config: WatchpostConfig, parts: PipelineParts) -> Result<(Self, CaptureUpdates)> {
        let logbook = Arc::new(Logbook::open(&config.log_dir)?);
        let email = EmailDispatcher::spawn(
            parts.transport,
            Arc::clone(&logbook),
            config.alerts.email_queue_depth,
        )?;
        let coordinator = Arc::new(AlertCoordinator::new(Arc::clone(&logbook), parts.sound, email));

        let flags = Arc::new(AlertFlags::new());
        let timer = SuppressionTimer::spawn(Arc::clone(&flags), config.alerts.window)
            .context("start alert suppression timer")?;

        let mode = config.detection.mode;
        let custom_categories = config.detection.custom_categories.clone();
        let configured: Vec<Category> = config.models.paths.keys().copied().collect();
        let settings = SettingsHandle::new(PipelineSettings {
            active: mode.active_categories(&configured, &custom_categories),
            email_recipient: config.alerts.email_recipient.clone(),
            sound_enabled: config.alerts.sound_enabled,
            source_label: String::new(),
        });

        let registry = ModelRegistry::new();
        let processor = Arc::new(FrameProcessor::new(
            registry.clone(),
            flags,
            Arc::clone(&coordinator),
            Annotator::from_config(config.font_path.as_deref()),
        ));
        let (capture, updates) = CaptureLoop::new(
            parts.sources,
            processor,
            settings.clone(),
            CaptureOptions {
                pause_poll: config.capture.pause_poll,
                stop_timeout: config.capture.stop_timeout,
            },
        );

        let pipeline = Self {
            config,
            registry,
            detectors: parts.detectors,
            loader: None,
            logbook,
            coordinator,
            timer,
            settings,
            mode,
            custom_categories,
            capture,
        };
        Ok((pipeline, updates))
    }

    pub fn config(&self) -> &WatchpostConfig {
        &self.config
    }

    pub fn logbook(&self) -> &Arc<Logbook> {
        &self.logbook
    }

    pub fn settings(&self) -> Arc<PipelineSettings> {
        self.settings.snapshot()
    }

    // ------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------

    /// Start loading every configured model in the background.
    pub fn load_models(&mut self) -> Result<()> {
        let handle = self
            .registry
            .spawn_load(self.config.models.paths.clone(), Arc::clone(&self.detectors))?;
        self.loader = Some(handle);
        Ok(())
    }

    pub fn model_state(&self) -> LoadState {
        self.registry.state()
    }

    /// Non-blocking check for the load completion event.
    pub fn poll_models(&mut self) -> Option<LoadEvent> {
        let event = self.loader.as_ref()?.try_event()?;
        self.loader = None;
        Some(event)
    }

    /// Wait up to `timeout` for the load completion event.
    pub fn wait_for_models(&mut self, timeout: Duration) -> Option<LoadEvent> {
        let event = self.loader.as_mut()?.wait(timeout)?;
        self.loader = None;
        Some(event)
    }

    // ------------------------------------------------------------------
    // Capture
    // ------------------------------------------------------------------

    /// Switch to a new source. Refused until models are ready.
    ///
    /// Alert flags are cleared so a condition that alerted on the previous source is
    /// reported again on this one.
    pub fn start(&mut self, handle: &VideoSourceHandle) -> Result<SourceInfo, PipelineError> {
        self.ensure_models_ready()?;
        let source = self.capture.open(handle)?;
        self.run_source(source)
    }

    /// Like `start`, on an already opened source.
    pub fn start_with(&mut self, source: Box<dyn VideoSource>) -> Result<SourceInfo, PipelineError> {
        self.ensure_models_ready()?;
        self.capture.stop();
        self.run_source(source)
    }

    fn ensure_models_ready(&self) -> Result<(), PipelineError> {
        if self.registry.is_ready() {
            Ok(())
        } else {
            log::warn!("cannot start capture: models are not loaded yet");
            Err(PipelineError::ModelsNotReady)
        }
    }

    /// The label is only switched once the source is open, and is cleared again if the
    /// worker cannot be started.
    fn run_source(&mut self, source: Box<dyn VideoSource>) -> Result<SourceInfo, PipelineError> {
        let label = source.describe().label();
        self.timer.restart();
        self.settings.update(|s| s.source_label = label);
        self.capture.start_with(source).map_err(|err| {
            self.settings.update(|s| s.source_label.clear());
            err
        })
    }

    pub fn stop(&mut self) {
        self.capture.stop();
    }

    pub fn pause(&self) {
        self.capture.pause();
    }

    pub fn resume(&self) {
        self.capture.resume();
    }

    pub fn toggle_pause(&self) -> CaptureState {
        self.capture.toggle_pause()
    }

    pub fn seek(&self, percent: f64) -> Option<u64> {
        self.capture.seek(percent)
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    pub fn source(&self) -> Option<&SourceInfo> {
        self.capture.source()
    }

    // ------------------------------------------------------------------
    // Operator settings
    // ------------------------------------------------------------------

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    /// Change the detection mode. Clears alert flags immediately.
    pub fn set_mode(&mut self, mode: DetectionMode) {
        self.mode = mode;
        self.refresh_active();
        self.timer.restart();
        log::info!("detection mode set to {:?}", mode);
    }

    /// Set the categories used by custom mode.
    pub fn set_custom_categories(&mut self, categories: BTreeSet<Category>) {
        self.custom_categories = categories;
        self.refresh_active();
    }

    fn refresh_active(&self) {
        let available: Vec<Category> = match self.registry.models() {
            Some(models) => models.categories(),
            None => self.config.models.paths.keys().copied().collect(),
        };
        let active = self
            .mode
            .active_categories(&available, &self.custom_categories);
        self.settings.update(|s| s.active = active);
    }

    pub fn set_email_recipient(&self, recipient: &str) {
        let recipient = recipient.trim().to_string();
        self.settings.update(|s| s.email_recipient = recipient);
    }

    pub fn set_sound_enabled(&self, enabled: bool) {
        self.settings.update(|s| s.sound_enabled = enabled);
    }

    /// Stop capture and drain queued alert emails.
    pub fn shutdown(mut self) {
        self.capture.stop();
        self.coordinator.shutdown();
    }
}
