use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure categories shared by the registry, the state machine and the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("participant {0} not found")]
    ParticipantNotFound(String),
    #[error("not permitted")]
    Forbidden,
    #[error("room is full ({capacity} participants)")]
    RoomFull { capacity: usize },
    #[error("rate limit exceeded, please try again later")]
    RateLimited,
    #[error("invalid request: {0}")]
    Invalid(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Wire form of [`SyncError`] carried in failed replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    Capacity,
    RateLimited,
    Invalid,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::RoomNotFound(_) | SyncError::ParticipantNotFound(_) => ErrorKind::NotFound,
            SyncError::Forbidden => ErrorKind::Forbidden,
            SyncError::RoomFull { .. } => ErrorKind::Capacity,
            SyncError::RateLimited => ErrorKind::RateLimited,
            SyncError::Invalid(_) => ErrorKind::Invalid,
        }
    }
}
