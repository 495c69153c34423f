//! Network error types

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Duplicate peer id: {0}")]
    DuplicateId(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Already started")]
    AlreadyStarted,

    #[error("Config error: {0}")]
    Config(String),
}
