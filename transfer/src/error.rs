//! Transfer errors and their classification.

use std::fmt;

use thiserror::Error;
use tokio::io;

use crate::checksum::Checksum;

/// Broad classification of a failure, as reported per chunk and per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or invalid endpoint, credentials or tuning values.
    Configuration,
    /// Local read/write failure.
    Io,
    /// Network or object store call failure.
    Transport,
    /// Checksum or length mismatch.
    Integrity,
    /// Task aborted before completion because a sibling failed.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Configuration => "configuration",
            Self::Io => "io",
            Self::Transport => "transport",
            Self::Integrity => "integrity",
            Self::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("object store returned status {status} for `{resource}`")]
    Status { status: u16, resource: String },
    #[error("object not found: `{bucket}/{key}`")]
    NotFound { bucket: String, key: String },
    #[error("checksum mismatch for {what}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        what: String,
        expected: Checksum,
        actual: Checksum,
    },
    #[error("length mismatch for {what}: expected {expected} bytes, got {actual}")]
    LengthMismatch { what: String, expected: u64, actual: u64 },
    #[error("invalid manifest: {0}")]
    Manifest(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Map this error onto the job-level failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Io(_) => ErrorKind::Io,
            Self::Reqwest(_) | Self::Status { .. } | Self::NotFound { .. } => ErrorKind::Transport,
            Self::ChecksumMismatch { .. } | Self::LengthMismatch { .. } | Self::Manifest(_) | Self::Json(_) => {
                ErrorKind::Integrity
            }
        }
    }

    /// Whether another attempt of the same call may succeed.
    ///
    /// Only transport failures are ever transient: connection errors, timeouts, throttling and server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Reqwest(err) => {
                err.is_connect()
                    || err.is_timeout()
                    || err.is_request()
                    || err.is_body()
                    || err.status().is_some_and(|status| status.is_server_error() || status.as_u16() == 429)
            }
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
