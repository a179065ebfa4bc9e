// Error taxonomy for a single pipeline run
//
// Adapters around third-party libraries report `anyhow` errors; they are
// converted into one of these variants at the pipeline boundary so callers
// can branch on `ErrorKind` instead of parsing messages.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot read video source {path}: {reason}")]
    Source { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no person was detected in the video")]
    NoSubject,

    #[error("people were detected, but none has an area ratio within [{min}, {max}]")]
    NoSubjectInWindow { min: f64, max: f64 },

    #[error("detection model unavailable: {0}")]
    Model(String),

    #[error("detection failed on frame {frame}: {reason}")]
    Detection { frame: usize, reason: String },

    #[error("splicing failed: {0}")]
    Splice(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Machine-readable error category, stable across message wording changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Source,
    Config,
    NoSubject,
    NoSubjectInWindow,
    Detection,
    Splice,
    Cancelled,
    Internal,
}

impl PipelineError {
    pub fn source(path: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Source {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn splice(message: impl Into<String>) -> Self {
        Self::Splice(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Source { .. } => ErrorKind::Source,
            Self::Config(_) => ErrorKind::Config,
            Self::NoSubject => ErrorKind::NoSubject,
            Self::NoSubjectInWindow { .. } => ErrorKind::NoSubjectInWindow,
            Self::Model(_) | Self::Detection { .. } => ErrorKind::Detection,
            Self::Splice(_) => ErrorKind::Splice,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Validation failures leave the source untouched and can be retried
    /// with different parameters.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NoSubject | ErrorKind::NoSubjectInWindow
        )
    }
}
