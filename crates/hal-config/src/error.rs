//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error(".hal9000.yml was invalid: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error(".hal9000.yml was invalid: {0}")]
    InvalidDocument(String),

    #[error("configuration key \"{0}\" is invalid")]
    InvalidKey(String),

    #[error("Too many commands specified for \"{0}\". Must be less than 10.")]
    TooManyCommands(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
