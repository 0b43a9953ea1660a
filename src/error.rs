//! Error types for stream operations.

use crate::usage::RateLimitKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Must create client with a private key to {0}")]
    MissingCredential(&'static str),

    #[error("Remote rejected request: {0}")]
    RemoteRejected(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Decode failure: {0}")]
    Decode(String),

    #[error("{0} unavailable until a row has been appended")]
    Unavailable(RateLimitKind),

    #[error("Unrecognized field discovery response: {0}")]
    Discovery(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
