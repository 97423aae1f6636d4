//! Error types for the router adapter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("discovery lookup failed: {0}")]
    Discovery(String),

    #[error("router is not connected")]
    NotConnected,

    #[error("downlink stream error: {0}")]
    Stream(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for backend::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::NotConnected => backend::Error::NotConnected,
            other => backend::Error::Transport(other.to_string()),
        }
    }
}
