//! Error types shared by the library modules.
//!
//! The CLI layer wraps these in `anyhow::Error`; library callers can match
//! on [`Error`] directly.

use serde::Deserialize;
use std::path::PathBuf;

/// Error object returned by the Concentriq API inside the response envelope.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: i64,
    pub name: String,
    pub code: i64,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("APIError: {0}")]
    Api(#[from] ApiError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing key in config '{key}' (looked in {})", .path.display())]
    MissingConfig { key: &'static str, path: PathBuf },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("upload failed: {0}")]
    Upload(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for annotation shapes or geometries the converter does not handle.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(_))
    }
}
