use thiserror::Error;

use crate::protocol::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not permitted: {0}")]
    Forbidden(String),
    #[error("room is full: {0}")]
    Capacity(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    /// Network trouble; safe to retry.
    #[error("connection problem: {0}")]
    Transient(String),
    /// The local runtime cannot play this media. Never retried.
    #[error("playback not supported: {0}")]
    Unsupported(String),
}

impl SyncError {
    pub fn from_reply(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::NotFound => SyncError::NotFound(message),
            ErrorKind::Forbidden => SyncError::Forbidden(message),
            ErrorKind::Capacity => SyncError::Capacity(message),
            ErrorKind::RateLimited => SyncError::RateLimited(message),
            ErrorKind::Invalid => SyncError::Invalid(message),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}
