//! Error types for mirror-node

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("Download error: {0}")]
    Download(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NodeError {
    /// Faults that are recovered locally by retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Auth(_)
                | NodeError::Download(_)
                | NodeError::Integrity { .. }
                | NodeError::Session(_)
                | NodeError::Timeout(_)
                | NodeError::Io(_)
        )
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NodeError::Timeout(e.to_string())
        } else {
            NodeError::Download(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
