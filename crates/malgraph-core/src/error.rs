//! Error types shared across the analysis pipeline

use std::path::PathBuf;
use std::time::Duration;

use crate::dot::DotError;

/// Failure of an external collaborator (knowledge store, oracle, registry).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{service} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        service: &'static str,
        attempts: u32,
        message: String,
    },
    #[error("{service} request failed: {message}")]
    Transport {
        service: &'static str,
        message: String,
    },
    #[error("{service} returned an unexpected response: {message}")]
    MalformedResponse {
        service: &'static str,
        message: String,
    },
}

impl ServiceError {
    pub fn transport(service: &'static str, message: impl Into<String>) -> Self {
        ServiceError::Transport {
            service,
            message: message.into(),
        }
    }

    pub fn malformed(service: &'static str, message: impl Into<String>) -> Self {
        ServiceError::MalformedResponse {
            service,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("graph export not found at '{path}'")]
    MissingExport { path: PathBuf },
    #[error("invalid graph export '{path}': {source}")]
    InvalidExport { path: PathBuf, source: DotError },
    #[error("package.json not found under '{path}'")]
    ManifestMissing { path: PathBuf },
    #[error("invalid package.json '{path}': {message}")]
    InvalidManifest { path: PathBuf, message: String },
    #[error("analysis exceeded its deadline of {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write report: {0}")]
    Report(#[from] serde_json::Error),
}

impl AnalysisError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AnalysisError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = AnalysisError> = std::result::Result<T, E>;
