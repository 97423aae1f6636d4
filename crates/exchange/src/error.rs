//! Error types for exchange start/stop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("exchange is already running")]
    AlreadyRunning,

    #[error("backend startup failed: {0}")]
    Startup(#[from] backend::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
