//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. These are infrastructure errors: they
//! surface to the caller of the failing operation and are never translated
//! into wire responses (pipeline rejections have their own representation in
//! `crate::protocol`).

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the Carapace host.
#[derive(Error, Debug)]
pub enum Error {
    /// Validation errors (bad identifiers, malformed declarations, bad config).
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource not found (unknown session, group, credential).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state for the requested operation (bus not bound, double bind).
    #[error("state error: {0}")]
    State(String),

    /// Container runtime failures (spawn, stop, inspect).
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Cancellation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }
}
