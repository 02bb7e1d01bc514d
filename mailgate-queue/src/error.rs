//! Error types for the mailgate-queue crate.

use mailgate_common::error::ValidationError;
use thiserror::Error;

/// Failures talking to the queue backend.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The AMQP broker reported an error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The broker refused to take responsibility for a published message.
    #[error("Broker rejected message")]
    Rejected,

    /// The queue has been shut down.
    #[error("Queue is closed")]
    Closed,

    /// A test backend was told to fail.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// Why an email request could not be accepted onto the queue.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Failed to publish request: {0}")]
    Queue(#[from] QueueError),
}

impl PublishError {
    /// Returns `true` if the request itself was at fault.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

/// Specialized `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
