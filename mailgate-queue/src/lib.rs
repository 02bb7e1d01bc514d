//! Durable queue between the gateway listener and the delivery worker.
//!
//! Producers hand validated requests to a [`Publisher`]; the delivery worker
//! subscribes through [`MessageQueue::subscribe`] and settles every
//! [`QueueMessage`] with an acknowledgment or a rejection.

pub mod backends;
pub mod config;
pub mod error;
pub mod message;
pub mod publisher;
pub mod queue;

pub use backends::{AmqpQueue, MemoryQueue};
pub use config::QueueConfig;
pub use error::{PublishError, QueueError, Result};
pub use message::{Acknowledge, QueueMessage};
pub use publisher::Publisher;
pub use queue::{Deliveries, MessageQueue};
