//! Error types for the virtual switch.

use thiserror::Error;

/// All possible errors that can occur within the virtual switch.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or truncated wire data.
    #[error("decode error: {0}")]
    Decode(String),

    /// Invalid or unloadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An admin object with the same identity is already present.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The referenced table, rule, address or connection does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An argument was rejected by validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}
