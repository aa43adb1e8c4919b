use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid accession: {0}")]
    InvalidAccession(String),

    #[error("accession not found: {0}")]
    NotFound(String),

    #[error("{archive} request failed: {message}")]
    RemoteHttp { archive: String, message: String },

    #[error("{archive} returned status {status}: {message}")]
    RemoteStatus {
        archive: String,
        status: u16,
        message: String,
    },

    #[error("{archive} returned an unreadable payload: {message}")]
    RemotePayload { archive: String, message: String },

    #[error("checksum validation failed for {0}")]
    ValidationFailure(String),

    #[error("transfer timed out after {seconds}s: {unit}")]
    TransferTimeout { unit: String, seconds: u64 },

    #[error("transfer failed for {unit}: {message}")]
    TransferFailed { unit: String, message: String },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("missing config file seqharvest.json in current directory")]
    #[diagnostic(help("pass --config <path> or create seqharvest.json"))]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl HarvestError {
    pub(crate) fn http(archive: &str, err: impl std::fmt::Display) -> Self {
        HarvestError::RemoteHttp {
            archive: archive.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn payload(archive: &str, err: impl std::fmt::Display) -> Self {
        HarvestError::RemotePayload {
            archive: archive.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn fs(err: impl std::fmt::Display) -> Self {
        HarvestError::Filesystem(err.to_string())
    }
}
