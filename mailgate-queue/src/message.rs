use async_trait::async_trait;

use crate::error::Result;

/// Settles a delivered message with the backend that delivered it.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Remove the message permanently
    async fn ack(&self) -> Result<()>;

    /// Reject the message, returning it to the queue when `requeue` is set
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a subscriber.
///
/// Settling consumes the message, so it can be acknowledged at most once.
pub struct QueueMessage {
    tag: u64,
    redelivered: bool,
    payload: Vec<u8>,
    acker: Box<dyn Acknowledge>,
}

impl std::fmt::Debug for QueueMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueMessage")
            .field("tag", &self.tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl QueueMessage {
    pub fn new(
        tag: u64,
        redelivered: bool,
        payload: Vec<u8>,
        acker: impl Acknowledge + 'static,
    ) -> Self {
        Self {
            tag,
            redelivered,
            payload,
            acker: Box::new(acker),
        }
    }

    /// Backend-assigned delivery tag
    pub const fn tag(&self) -> u64 {
        self.tag
    }

    /// Whether this message was delivered before and not acknowledged
    pub const fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Acknowledge successful processing.
    ///
    /// # Errors
    /// If the backend could not record the acknowledgment.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the message.
    ///
    /// # Errors
    /// If the backend could not record the rejection.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}
