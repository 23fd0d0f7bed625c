//! Durable detection and email history.
//!
//! Two append-only CSV files live in the log directory:
//!
//! - `detection_log.csv`: `Timestamp,Type,Details`
//! - `email_log.csv`: `Timestamp,Type,Recipient,Status`
//!
//! Rows are appended without rewriting earlier content. Each file keeps an in-memory
//! mirror that is only extended after the row is flushed to disk, so the mirror never
//! shows a row the file does not have.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::Category;

pub const DETECTION_LOG_FILE: &str = "detection_log.csv";
pub const EMAIL_LOG_FILE: &str = "email_log.csv";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const DETECTION_HEADER: [&str; 3] = ["Timestamp", "Type", "Details"];
const EMAIL_HEADER: [&str; 4] = ["Timestamp", "Type", "Recipient", "Status"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionLogEntry {
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "Type")]
    pub category: String,
    #[serde(rename = "Details")]
    pub details: String,
}

impl DetectionLogEntry {
    pub fn alert(category: Category, at: &DateTime<Local>, source_label: &str) -> Self {
        Self {
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
            category: category.display_name().to_string(),
            details: format!("Source: {}", source_label),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EmailStatus {
    Success,
    Failed(String),
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmailStatus::Success => f.write_str("Success"),
            EmailStatus::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

impl FromStr for EmailStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "Success" {
            return Ok(EmailStatus::Success);
        }
        match s.strip_prefix("Failed:") {
            Some(reason) => Ok(EmailStatus::Failed(reason.trim_start().to_string())),
            None => Err(anyhow!("unrecognised email status '{}'", s)),
        }
    }
}

impl From<EmailStatus> for String {
    fn from(status: EmailStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for EmailStatus {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailLogEntry {
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "Type")]
    pub category: String,
    #[serde(rename = "Recipient")]
    pub recipient: String,
    #[serde(rename = "Status")]
    pub status: EmailStatus,
}

impl EmailLogEntry {
    /// `timestamp` is the alert's own timestamp, not the time the send finished.
    pub fn new(category: Category, timestamp: &str, recipient: &str, status: EmailStatus) -> Self {
        Self {
            timestamp: timestamp.to_string(),
            category: category.display_name().to_string(),
            recipient: recipient.to_string(),
            status,
        }
    }
}

struct CsvTable<T> {
    path: PathBuf,
    rows: Vec<T>,
}

impl<T> CsvTable<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn open(path: PathBuf, header: &[&str]) -> Result<Self> {
        if !path.exists() {
            let mut writer = csv::Writer::from_path(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            writer.write_record(header)?;
            writer.flush()?;
        }
        let rows = read_rows(&path)?;
        Ok(Self { path, rows })
    }

    fn append(&mut self, row: T) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.serialize(&row)?;
        writer.flush()?;
        self.rows.push(row);
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        self.rows = read_rows(&self.path)?;
        Ok(())
    }
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = csv::Reader::from_reader(file);
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: T = record.with_context(|| format!("malformed row in {}", path.display()))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Log directory, the two CSV tables, and the snapshot naming scheme.
pub struct Logbook {
    dir: PathBuf,
    detections: Mutex<CsvTable<DetectionLogEntry>>,
    emails: Mutex<CsvTable<EmailLogEntry>>,
}

impl Logbook {
    /// Create the directory and both files (with headers) if missing, then load the mirror.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        let detections = CsvTable::open(dir.join(DETECTION_LOG_FILE), &DETECTION_HEADER)?;
        let emails = CsvTable::open(dir.join(EMAIL_LOG_FILE), &EMAIL_HEADER)?;
        log::info!(
            "logbook opened at {} ({} detections, {} emails)",
            dir.display(),
            detections.rows.len(),
            emails.rows.len()
        );
        Ok(Self {
            dir,
            detections: Mutex::new(detections),
            emails: Mutex::new(emails),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn detection_log_path(&self) -> PathBuf {
        self.dir.join(DETECTION_LOG_FILE)
    }

    pub fn email_log_path(&self) -> PathBuf {
        self.dir.join(EMAIL_LOG_FILE)
    }

    /// `{dir}/{category}_alert_{YYYYMMDD_HHMMSS}.jpg`
    pub fn snapshot_path(&self, category: Category, at: &DateTime<Local>) -> PathBuf {
        self.dir.join(format!(
            "{}_alert_{}.jpg",
            category.as_str(),
            at.format("%Y%m%d_%H%M%S")
        ))
    }

    pub fn append_detection(&self, entry: DetectionLogEntry) -> Result<(), PipelineError> {
        lock(&self.detections)
            .append(entry)
            .map_err(|e| PipelineError::log_write(format!("{:#}", e)))
    }

    pub fn append_email(&self, entry: EmailLogEntry) -> Result<(), PipelineError> {
        lock(&self.emails)
            .append(entry)
            .map_err(|e| PipelineError::log_write(format!("{:#}", e)))
    }

    pub fn detections(&self) -> Vec<DetectionLogEntry> {
        lock(&self.detections).rows.clone()
    }

    pub fn emails(&self) -> Vec<EmailLogEntry> {
        lock(&self.emails).rows.clone()
    }

    /// Re-read both files into the mirror.
    pub fn reload(&self) -> Result<()> {
        lock(&self.detections).reload()?;
        lock(&self.emails).reload()?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
