//! Error types for notez-core

use thiserror::Error;

/// Result type alias using notez-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in notez-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected before any network call
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Transient transport failure
    #[error("Network error: {0}")]
    Network(String),

    /// The server's record advanced past the version this client knows
    #[error("Version conflict (server is at version {})", current_version.map_or_else(|| "unknown".to_string(), |version| version.to_string()))]
    VersionConflict { current_version: Option<i64> },

    /// No record exists for the key yet
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was cancelled by a newer one
    #[error("Request cancelled")]
    Cancelled,

    /// Non-success response that is not otherwise classified
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Response body could not be interpreted
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A destructive reload was requested without confirmation
    #[error("Reloading would discard unsaved local changes")]
    UnsavedChanges,

    /// A version-checked save was requested while a remote update is unresolved
    #[error("A newer version exists on the server; choose 'use theirs' or 'keep mine'")]
    ConflictPending,

    /// The session task has stopped
    #[error("Note session is closed")]
    SessionClosed,
}

impl Error {
    /// Whether this error should ever reach the user. Cancellations never do.
    pub const fn is_user_visible(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Short banner text for the error.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::Network(_) => "No internet connection. Please check your network.".to_string(),
            Self::NotFound(_) => "Resource not found.".to_string(),
            Self::Api { status, message } => match status {
                400 if !message.is_empty() => message.clone(),
                400 => "Invalid request. Please check your input.".to_string(),
                500..=599 => "Server error. Please try again later.".to_string(),
                _ => message.clone(),
            },
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::InvalidPayload(error.to_string())
        } else if let Some(status) = error.status() {
            Self::Api {
                status: status.as_u16(),
                message: error.to_string(),
            }
        } else {
            Self::Network(error.to_string())
        }
    }
}
