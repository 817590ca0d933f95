use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a `ReactiveBackend`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The write or read could not be confirmed. The outcome is unknown.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The identity attached to a write is unknown to the store.
    #[error("unknown or invalid identity")]
    Unauthorized,

    /// The post a write targets does not exist.
    #[error("post {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("comment body is empty")]
    EmptyBody,

    #[error("comment body is {actual} characters, the limit is {max}")]
    BodyTooLong { max: usize, actual: usize },

    #[error("post {0} does not exist")]
    UnknownPost(Uuid),
}

/// Why a comment submission failed. Nothing here is retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("invalid comment: {0}")]
    Validation(#[from] ValidationError),

    #[error("sign in to comment")]
    Unauthenticated,

    #[error("comment was not confirmed: {0}")]
    Transient(String),
}

impl From<BackendError> for SubmitError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(reason) => Self::Transient(reason),
            BackendError::Unauthorized => Self::Unauthenticated,
            BackendError::NotFound(post_id) => Self::Validation(ValidationError::UnknownPost(post_id)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HydrationError {
    #[error("snapshot is for post {actual}, expected {expected}")]
    SnapshotMismatch { expected: Uuid, actual: Uuid },

    #[error("snapshot was already consumed")]
    AlreadyConsumed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeatInterval,

    #[error("max_missed_heartbeats must be at least 2, got {0}")]
    TooFewMissedHeartbeats(u32),

    #[error("presence timeout is out of range")]
    TimeoutOutOfRange,

    #[error("comment limit must be greater than zero")]
    ZeroCommentLimit,
}
