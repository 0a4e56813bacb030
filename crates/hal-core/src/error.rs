//! Error types for the HAL agent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("missing property: {0}")]
    MissingProperty(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("command `{command}` failed with exit code {exit_code:?}: {output}")]
    Transport {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("permission check failed for {directory} (owner {required_owner}, writeable: {writeable}): {listing}")]
    Permission {
        directory: String,
        listing: String,
        required_owner: String,
        writeable: bool,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("decryption failed: expected {expected} properties, got {actual}")]
    Decryption { expected: usize, actual: usize },

    #[error("path escapes its base directory: {path}")]
    Traversal { path: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
