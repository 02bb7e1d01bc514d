use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{error::Result, message::QueueMessage};

/// Messages delivered to a subscriber, in delivery order.
pub type Deliveries = BoxStream<'static, Result<QueueMessage>>;

/// A durable, at-least-once work queue with a fixed identity.
///
/// Publishing must be safe from many tasks at once. A subscriber never holds
/// more than `prefetch` unsettled messages.
#[async_trait]
pub trait MessageQueue: Send + Sync + std::fmt::Debug {
    /// Persist `payload` on the queue.
    ///
    /// Returns once the backend has taken responsibility for the message.
    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    /// Start consuming from the queue.
    ///
    /// The stream ends when the backend closes the subscription.
    async fn subscribe(&self, prefetch: u16) -> Result<Deliveries>;

    /// Number of messages waiting to be delivered
    async fn depth(&self) -> Result<u32>;
}
