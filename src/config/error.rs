use crate::error::SerialError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while loading, layering or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read '{path}': {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Cannot encode configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Cannot write '{path}': {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The `[port]` section is well-formed but not a usable line setup.
    #[error("Invalid [port] section: {0}")]
    InvalidPort(#[from] SerialError),

    #[error("Bad value in {var}: {message}")]
    EnvParseError { var: String, message: String },

    #[error("Missing configuration: {0}")]
    MissingRequired(String),
}

impl ConfigError {
    pub fn env_parse(var: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EnvParseError {
            var: var.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
