//! Error types for oath-sockd

use std::io;

use thiserror::Error;

/// Result type alias for oath-sockd
pub type Result<T> = std::result::Result<T, Error>;

/// oath-sockd errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Directory transport error (connection lost, timeout, server down)
    #[error("Directory error: {0}")]
    Directory(String),

    /// Optimistic-concurrency precondition rejected a counter write.
    /// Expected under concurrent validation of the same token; never
    /// retried, never downgraded to an invalid-credentials verdict.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Decryption key referenced by a stored secret is not in the keyring
    #[error("Decryption key not found: {0}")]
    KeyNotFound(String),

    /// Malformed stored secret, envelope, or base32 payload
    #[error("Decode error: {0}")]
    Decode(String),

    /// Credential hash carries a scheme this build cannot verify
    #[error("Unknown credential hash scheme: {0}")]
    UnknownHashScheme(String),

    /// Malformed request on the socket protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Transient errors are worth retrying against the directory; everything
    /// else (including precondition rejections) must surface immediately.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Directory(_) | Self::Io(_))
    }
}
