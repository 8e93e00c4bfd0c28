//! Error types for parley-wire

use thiserror::Error;

/// Result type alias using parley-wire Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to a reply service
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The service answered with a non-success status
    #[error("Service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Connection could not be established or was lost
    #[error("Transport error: {0}")]
    Transport(String),

    /// Stream was aborted
    #[error("Request aborted")]
    Aborted,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a status error from a code and response body
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            status,
            body: body.into(),
        }
    }

    /// Check if this error came from the network rather than from local misuse
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Http(e) => !e.is_builder(),
            Error::Status { .. } | Error::Transport(_) => true,
            _ => false,
        }
    }

    /// Check if the request timed out, either connecting or between reads
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Http(e) => e.is_timeout(),
            Error::Transport(msg) => msg.to_lowercase().contains("timed out"),
            _ => false,
        }
    }
}
