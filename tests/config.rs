use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use watchpost::config::CameraBackend;
use watchpost::{Category, DetectionMode, WatchpostConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "WATCHPOST_CONFIG",
        "WATCHPOST_LOG_DIR",
        "WATCHPOST_MODE",
        "WATCHPOST_EMAIL_TO",
        "WATCHPOST_SMTP_USER",
        "WATCHPOST_SMTP_PASSWORD",
        "WATCHPOST_ALERT_WINDOW_SECS",
        "WATCHPOST_SOUND",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let file = write_config(
        r#"{
            "log_dir": "/var/lib/watchpost/logs",
            "models": {
                "paths": {
                    "fire": "/opt/models/fire_v5.onnx",
                    "weapon": "/opt/models/weapon_v8.onnx"
                },
                "input_size": 416
            },
            "detection": {
                "mode": "custom",
                "custom_categories": ["fire"]
            },
            "alerts": {
                "window_secs": 30,
                "email_recipient": "night-shift@example.com",
                "email_queue_depth": 16
            },
            "smtp": {
                "host": "mail.example.com",
                "port": 2465,
                "username": "alerts@example.com",
                "password": "from-file"
            },
            "capture": {
                "pause_poll_ms": 25,
                "camera_backend": "synthetic",
                "synthetic_fps": 5
            }
        }"#,
    );

    std::env::set_var("WATCHPOST_CONFIG", file.path());
    std::env::set_var("WATCHPOST_MODE", "indoor");
    std::env::set_var("WATCHPOST_EMAIL_TO", " ops@example.com ");
    std::env::set_var("WATCHPOST_SMTP_PASSWORD", "from-env");
    std::env::set_var("WATCHPOST_SOUND", "off");

    let cfg = WatchpostConfig::load().expect("load config");

    assert_eq!(cfg.log_dir, PathBuf::from("/var/lib/watchpost/logs"));
    assert_eq!(cfg.models.paths.len(), 2);
    assert_eq!(
        cfg.models.paths[&Category::Fire],
        PathBuf::from("/opt/models/fire_v5.onnx")
    );
    assert_eq!(cfg.models.input_size, 416);
    assert_eq!(cfg.detection.mode, DetectionMode::Indoor);
    assert!(cfg.detection.custom_categories.contains(&Category::Fire));
    assert_eq!(cfg.alerts.window, Duration::from_secs(30));
    assert_eq!(cfg.alerts.email_recipient, "ops@example.com");
    assert_eq!(cfg.alerts.email_queue_depth, 16);
    assert!(!cfg.alerts.sound_enabled);
    assert_eq!(cfg.smtp.host, "mail.example.com");
    assert_eq!(cfg.smtp.port, 2465);
    assert_eq!(cfg.smtp.sender, "alerts@example.com");
    assert_eq!(cfg.smtp.password, "from-env");
    assert_eq!(cfg.capture.pause_poll, Duration::from_millis(25));
    assert_eq!(cfg.capture.camera_backend, CameraBackend::Synthetic);
    assert_eq!(cfg.capture.synthetic_fps, 5);

    clear_env();
}

#[test]
fn defaults_apply_without_a_config_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    let cfg = WatchpostConfig::load().expect("load defaults");
    assert_eq!(cfg.log_dir, PathBuf::from("logs"));
    assert_eq!(cfg.alerts.window, Duration::from_secs(10));
    assert_eq!(cfg.alerts.email_queue_depth, 8);
    assert_eq!(cfg.detection.mode, DetectionMode::Outdoor);
    assert_eq!(cfg.smtp.host, "smtp.gmail.com");
    assert_eq!(
        cfg.models.paths[&Category::Accident],
        PathBuf::from("models/accident.onnx")
    );
    assert!(cfg.alerts.email_recipient.is_empty());
}

#[test]
fn smtp_user_from_env_becomes_the_sender() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    std::env::set_var("WATCHPOST_SMTP_USER", "watchpost@example.com");
    let cfg = WatchpostConfig::load().expect("load config");
    assert_eq!(cfg.smtp.username, "watchpost@example.com");
    assert_eq!(cfg.smtp.sender, "watchpost@example.com");

    clear_env();
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    clear_env();

    std::env::set_var("WATCHPOST_ALERT_WINDOW_SECS", "0");
    assert!(WatchpostConfig::load().is_err());
    std::env::set_var("WATCHPOST_ALERT_WINDOW_SECS", "ten");
    assert!(WatchpostConfig::load().is_err());
    clear_env();

    std::env::set_var("WATCHPOST_MODE", "night");
    assert!(WatchpostConfig::load().is_err());
    clear_env();

    let file = write_config(r#"{ "detection": { "mode": "custom" } }"#);
    std::env::set_var("WATCHPOST_CONFIG", file.path());
    assert!(WatchpostConfig::load().is_err());
    clear_env();

    let file = write_config(r#"{ "capture": { "pause_poll_ms": 500 } }"#);
    std::env::set_var("WATCHPOST_CONFIG", file.path());
    assert!(WatchpostConfig::load().is_err());
    clear_env();

    let file = write_config("{ not json");
    std::env::set_var("WATCHPOST_CONFIG", file.path());
    assert!(WatchpostConfig::load().is_err());
    clear_env();
}
