//! Error types for backend operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend is not connected")]
    NotConnected,

    #[error("subscription channel closed")]
    ChannelClosed,

    #[error("publish timed out")]
    Timeout,

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;
