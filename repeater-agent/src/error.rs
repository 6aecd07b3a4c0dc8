//! Error types for repeater-agent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Repeater library error.
    #[error("{0}")]
    Repeater(#[from] repeater_lib::Error),

    /// Service installation error.
    #[error("Install error: {0}")]
    Install(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
