use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::Category;

const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_IOU: f32 = 0.45;
const DEFAULT_ALERT_WINDOW_SECS: u64 = 10;
const DEFAULT_EMAIL_QUEUE_DEPTH: usize = 8;
const DEFAULT_SMTP_HOST: &str = "smtp.gmail.com";
const DEFAULT_SMTP_PORT: u16 = 465;
const DEFAULT_PAUSE_POLL_MS: u64 = 50;
const MAX_PAUSE_POLL_MS: u64 = 100;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 1000;
const DEFAULT_SYNTHETIC_WIDTH: u32 = 640;
const DEFAULT_SYNTHETIC_HEIGHT: u32 = 480;
const DEFAULT_SYNTHETIC_FPS: u32 = 15;

#[derive(Debug, Deserialize, Default)]
struct WatchpostConfigFile {
    log_dir: Option<PathBuf>,
    font_path: Option<PathBuf>,
    models: Option<ModelsConfigFile>,
    detection: Option<DetectionConfigFile>,
    alerts: Option<AlertsConfigFile>,
    smtp: Option<SmtpConfigFile>,
    capture: Option<CaptureConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsConfigFile {
    paths: Option<BTreeMap<Category, PathBuf>>,
    input_size: Option<u32>,
    iou: Option<f32>,
    class_names: Option<BTreeMap<Category, Vec<String>>>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    mode: Option<DetectionMode>,
    custom_categories: Option<Vec<Category>>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    window_secs: Option<u64>,
    sound_enabled: Option<bool>,
    sound_command: Option<Vec<String>>,
    email_recipient: Option<String>,
    email_queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct SmtpConfigFile {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    sender: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    pause_poll_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    camera_backend: Option<CameraBackend>,
    synthetic_width: Option<u32>,
    synthetic_height: Option<u32>,
    synthetic_fps: Option<u32>,
}

/// Which categories run on each frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Every loaded category except accident.
    Indoor,
    /// Every loaded category.
    Outdoor,
    /// An explicit operator-chosen set.
    Custom,
}

impl DetectionMode {
    /// Resolve the active set against the categories that actually loaded.
    pub fn active_categories(
        self,
        loaded: &[Category],
        custom: &BTreeSet<Category>,
    ) -> BTreeSet<Category> {
        loaded
            .iter()
            .copied()
            .filter(|category| match self {
                DetectionMode::Indoor => *category != Category::Accident,
                DetectionMode::Outdoor => true,
                DetectionMode::Custom => custom.contains(category),
            })
            .collect()
    }
}

impl FromStr for DetectionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "indoor" => Ok(DetectionMode::Indoor),
            "outdoor" => Ok(DetectionMode::Outdoor),
            "custom" => Ok(DetectionMode::Custom),
            other => Err(anyhow!(
                "unknown detection mode '{}' (expected indoor, outdoor or custom)",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    /// Generated frames; no device required.
    Synthetic,
    /// Linux V4L2 device `/dev/video{index}` (feature `ingest-v4l2`).
    V4l2,
}

impl FromStr for CameraBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synthetic" | "stub" => Ok(CameraBackend::Synthetic),
            "v4l2" => Ok(CameraBackend::V4l2),
            other => Err(anyhow!("unknown camera backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchpostConfig {
    pub log_dir: PathBuf,
    pub font_path: Option<PathBuf>,
    pub models: ModelSettings,
    pub detection: DetectionSettings,
    pub alerts: AlertSettings,
    pub smtp: SmtpSettings,
    pub capture: CaptureSettings,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub paths: BTreeMap<Category, PathBuf>,
    pub input_size: u32,
    pub iou: f32,
    pub class_names: BTreeMap<Category, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub mode: DetectionMode,
    pub custom_categories: BTreeSet<Category>,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub window: Duration,
    pub sound_enabled: bool,
    /// Player command for the alert cue; the terminal bell when absent.
    pub sound_command: Option<Vec<String>>,
    pub email_recipient: String,
    pub email_queue_depth: usize,
}

#[derive(Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub sender: String,
}

impl std::fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("sender", &self.sender)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub pause_poll: Duration,
    pub stop_timeout: Duration,
    pub camera_backend: CameraBackend,
    pub synthetic_width: u32,
    pub synthetic_height: u32,
    pub synthetic_fps: u32,
}

impl Default for WatchpostConfig {
    fn default() -> Self {
        Self::from_file(WatchpostConfigFile::default())
    }
}

impl WatchpostConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WATCHPOST_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: WatchpostConfigFile) -> Self {
        let log_dir = file
            .log_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));

        let models_file = file.models.unwrap_or_default();
        let models = ModelSettings {
            paths: models_file.paths.unwrap_or_else(default_model_paths),
            input_size: models_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            iou: models_file.iou.unwrap_or(DEFAULT_IOU),
            class_names: models_file.class_names.unwrap_or_default(),
        };

        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            mode: detection_file.mode.unwrap_or(DetectionMode::Outdoor),
            custom_categories: detection_file
                .custom_categories
                .unwrap_or_default()
                .into_iter()
                .collect(),
        };

        let alerts_file = file.alerts.unwrap_or_default();
        let alerts = AlertSettings {
            window: Duration::from_secs(
                alerts_file
                    .window_secs
                    .unwrap_or(DEFAULT_ALERT_WINDOW_SECS),
            ),
            sound_enabled: alerts_file.sound_enabled.unwrap_or(true),
            sound_command: alerts_file.sound_command,
            email_recipient: alerts_file.email_recipient.unwrap_or_default(),
            email_queue_depth: alerts_file
                .email_queue_depth
                .unwrap_or(DEFAULT_EMAIL_QUEUE_DEPTH),
        };

        let smtp_file = file.smtp.unwrap_or_default();
        let username = smtp_file.username.unwrap_or_default();
        let smtp = SmtpSettings {
            host: smtp_file
                .host
                .unwrap_or_else(|| DEFAULT_SMTP_HOST.to_string()),
            port: smtp_file.port.unwrap_or(DEFAULT_SMTP_PORT),
            sender: smtp_file.sender.unwrap_or_else(|| username.clone()),
            username,
            password: smtp_file.password.unwrap_or_default(),
        };

        let capture_file = file.capture.unwrap_or_default();
        let capture = CaptureSettings {
            pause_poll: Duration::from_millis(
                capture_file.pause_poll_ms.unwrap_or(DEFAULT_PAUSE_POLL_MS),
            ),
            stop_timeout: Duration::from_millis(
                capture_file
                    .stop_timeout_ms
                    .unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
            ),
            camera_backend: capture_file
                .camera_backend
                .unwrap_or_else(default_camera_backend),
            synthetic_width: capture_file
                .synthetic_width
                .unwrap_or(DEFAULT_SYNTHETIC_WIDTH),
            synthetic_height: capture_file
                .synthetic_height
                .unwrap_or(DEFAULT_SYNTHETIC_HEIGHT),
            synthetic_fps: capture_file.synthetic_fps.unwrap_or(DEFAULT_SYNTHETIC_FPS),
        };

        Self {
            log_dir,
            font_path: file.font_path,
            models,
            detection,
            alerts,
            smtp,
            capture,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("WATCHPOST_LOG_DIR") {
            if !dir.trim().is_empty() {
                self.log_dir = PathBuf::from(dir);
            }
        }
        if let Ok(mode) = std::env::var("WATCHPOST_MODE") {
            if !mode.trim().is_empty() {
                self.detection.mode = mode.parse()?;
            }
        }
        if let Ok(recipient) = std::env::var("WATCHPOST_EMAIL_TO") {
            self.alerts.email_recipient = recipient.trim().to_string();
        }
        if let Ok(user) = std::env::var("WATCHPOST_SMTP_USER") {
            if !user.trim().is_empty() {
                if self.smtp.sender.is_empty() || self.smtp.sender == self.smtp.username {
                    self.smtp.sender = user.clone();
                }
                self.smtp.username = user;
            }
        }
        if let Ok(password) = std::env::var("WATCHPOST_SMTP_PASSWORD") {
            if !password.is_empty() {
                self.smtp.password = password;
            }
        }
        if let Ok(window) = std::env::var("WATCHPOST_ALERT_WINDOW_SECS") {
            let seconds: u64 = window.parse().map_err(|_| {
                anyhow!("WATCHPOST_ALERT_WINDOW_SECS must be an integer number of seconds")
            })?;
            self.alerts.window = Duration::from_secs(seconds);
        }
        if let Ok(sound) = std::env::var("WATCHPOST_SOUND") {
            self.alerts.sound_enabled = parse_switch(&sound)
                .ok_or_else(|| anyhow!("WATCHPOST_SOUND must be on or off"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.alerts.window.is_zero() {
            return Err(anyhow!("alert window must be greater than zero"));
        }
        if self.alerts.email_queue_depth == 0 {
            return Err(anyhow!("email queue depth must be greater than zero"));
        }
        let poll_ms = self.capture.pause_poll.as_millis() as u64;
        if poll_ms == 0 || poll_ms > MAX_PAUSE_POLL_MS {
            return Err(anyhow!(
                "pause poll interval must be between 1 and {} ms",
                MAX_PAUSE_POLL_MS
            ));
        }
        if self.capture.stop_timeout.is_zero() {
            return Err(anyhow!("stop timeout must be greater than zero"));
        }
        if self.models.paths.is_empty() {
            return Err(anyhow!("at least one detection model must be configured"));
        }
        if self.detection.mode == DetectionMode::Custom && self.detection.custom_categories.is_empty()
        {
            return Err(anyhow!("custom detection mode requires custom_categories"));
        }
        if !(0.0..=1.0).contains(&self.models.iou) {
            return Err(anyhow!("model IoU threshold must be within [0, 1]"));
        }
        Ok(())
    }
}

fn default_model_paths() -> BTreeMap<Category, PathBuf> {
    Category::ALL
        .into_iter()
        .map(|category| {
            (
                category,
                PathBuf::from(format!("models/{}.onnx", category.as_str())),
            )
        })
        .collect()
}

fn default_camera_backend() -> CameraBackend {
    if cfg!(feature = "ingest-v4l2") {
        CameraBackend::V4l2
    } else {
        CameraBackend::Synthetic
    }
}

fn read_config_file(path: &Path) -> Result<WatchpostConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Some(true),
        "0" | "off" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = WatchpostConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.alerts.window, Duration::from_secs(10));
        assert_eq!(cfg.capture.stop_timeout, Duration::from_secs(1));
        assert_eq!(cfg.models.paths.len(), 4);
        assert_eq!(cfg.smtp.port, 465);
    }

    #[test]
    fn indoor_mode_excludes_accident() {
        let loaded = Category::ALL.to_vec();
        let active = DetectionMode::Indoor.active_categories(&loaded, &BTreeSet::new());
        assert!(!active.contains(&Category::Accident));
        assert_eq!(active.len(), 3);
    }

    #[test]
    fn custom_mode_is_limited_to_loaded_categories() {
        let loaded = vec![Category::Fire, Category::Object];
        let custom: BTreeSet<_> = [Category::Fire, Category::Weapon].into_iter().collect();
        let active = DetectionMode::Custom.active_categories(&loaded, &custom);
        assert_eq!(active.into_iter().collect::<Vec<_>>(), vec![Category::Fire]);
    }

    #[test]
    fn pause_poll_above_bound_is_rejected() {
        let mut cfg = WatchpostConfig::default();
        cfg.capture.pause_poll = Duration::from_millis(250);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn smtp_password_is_redacted_in_debug_output() {
        let mut cfg = WatchpostConfig::default();
        cfg.smtp.password = "hunter2".to_string();
        assert!(!format!("{:?}", cfg).contains("hunter2"));
    }
}
