use std::sync::Arc;

use chrono::Utc;
use mailgate_common::{Counter, EmailRequest, Observer, Validation, internal};

use crate::{error::PublishError, queue::MessageQueue};

/// Producer side of the queue bridge.
///
/// Cheap to clone; every connection task holds one.
#[derive(Debug, Clone)]
pub struct Publisher {
    queue: Arc<dyn MessageQueue>,
    observer: Arc<dyn Observer>,
}

impl Publisher {
    pub fn new(queue: Arc<dyn MessageQueue>, observer: Arc<dyn Observer>) -> Self {
        Self { queue, observer }
    }

    /// Validate `request`, stamp it with the current time and hand it to the
    /// queue. Returns once the queue has accepted it.
    ///
    /// # Errors
    /// If the request has no recipients, or the queue refused it. Queue
    /// failures are also counted as email errors.
    pub async fn publish(&self, request: EmailRequest) -> Result<(), PublishError> {
        request.validate(Validation::Queued)?;

        let result = self.enqueue(request.queued(Utc::now())).await;

        match &result {
            Ok(()) => self.observer.increment(Counter::EmailsQueued),
            Err(err) => {
                internal!(level = ERROR, "Failed to queue email: {err}");
                self.observer.increment(Counter::EmailErrors);
            }
        }

        result
    }

    async fn enqueue(&self, request: EmailRequest) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(&request)?;
        self.queue.publish(payload).await?;

        internal!(
            level = DEBUG,
            "Queued email for {} recipient(s)",
            request.recipients.len()
        );

        Ok(())
    }
}
