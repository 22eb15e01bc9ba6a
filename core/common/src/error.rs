//! Common error types for Polyweave.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for Polyweave operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed operation. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A provider with this name is already registered.
    #[error("Duplicate provider: {0}")]
    DuplicateProvider(String),

    /// No provider with this name is registered.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// No registered provider satisfies the operation's requirements.
    #[error("No suitable provider: {0}")]
    NoSuitableProvider(String),

    /// Transient backend or network failure.
    #[error("Recoverable error: {message}")]
    Recoverable {
        message: String,
        retry_after: Option<Duration>,
    },

    /// A provider call exceeded the operation timeout.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Authentication failure, schema mismatch and the like. Never retried.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation was cancelled by the caller.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration rejected at load time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a recoverable error without a retry hint.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Error::Recoverable {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Whether the executor may retry the failed call.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Recoverable { .. } | Error::Timeout(_))
    }

    /// Retry hint carried by the error, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Recoverable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Machine-readable code placed in result envelopes.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation(_) => ErrorCode::ValidationError,
            Error::DuplicateProvider(_) => ErrorCode::DuplicateProvider,
            Error::UnknownProvider(_) => ErrorCode::UnknownProvider,
            Error::NoSuitableProvider(_) => ErrorCode::NoSuitableProvider,
            Error::Recoverable { .. } => ErrorCode::RecoverableError,
            Error::Timeout(_) => ErrorCode::Timeout,
            Error::Fatal(_) => ErrorCode::FatalError,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::InvalidState(_) => ErrorCode::InvalidState,
            Error::Cancelled(_) => ErrorCode::Cancelled,
            Error::Config(_) => ErrorCode::ConfigError,
            Error::Serialization(_) | Error::Io(_) => ErrorCode::InternalError,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Error codes exposed in the operation envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    DuplicateProvider,
    UnknownProvider,
    NoSuitableProvider,
    RecoverableError,
    Timeout,
    FatalError,
    NotFound,
    InvalidState,
    Cancelled,
    ConfigError,
    InternalError,
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
