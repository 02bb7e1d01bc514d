mod amqp;
mod memory;

pub use amqp::AmqpQueue;
pub use memory::MemoryQueue;
