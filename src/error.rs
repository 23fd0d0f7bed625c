use std::path::PathBuf;

use thiserror::Error;

use crate::Category;

/// Failures the pipeline surfaces to its caller or records for the operator.
///
/// Model errors abort loading as a whole. Detector, email, and log-write failures are
/// contained where they occur and only logged; they never stop the capture loop.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("model path does not exist for '{category}': {}", path.display())]
    ModelPathNotFound { category: Category, path: PathBuf },

    #[error("failed to load '{category}' model: {reason}")]
    ModelLoadFailure { category: Category, reason: String },

    #[error("detection models are not loaded yet")]
    ModelsNotReady,

    #[error("video source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("'{category}' detector failed: {reason}")]
    DetectorInvocationFailure { category: Category, reason: String },

    #[error("email send failed: {0}")]
    EmailSendFailure(String),

    #[error("log write failed: {0}")]
    LogWriteFailure(String),
}

impl PipelineError {
    pub fn source_unavailable(err: impl std::fmt::Display) -> Self {
        PipelineError::SourceUnavailable(err.to_string())
    }

    pub fn log_write(err: impl std::fmt::Display) -> Self {
        PipelineError::LogWriteFailure(err.to_string())
    }
}
