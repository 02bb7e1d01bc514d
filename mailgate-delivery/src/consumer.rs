//! The delivery worker.
//!
//! Takes one message at a time off the queue and hands it to the mail
//! transport. Every message is settled exactly once:
//!
//! - undecodable or recipient-less payloads are rejected for good,
//! - transport failures are returned to the queue after a pause,
//! - deliveries are acknowledged.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use futures_util::StreamExt;
use mailgate_common::{
    Counter, EmailRequest, Histogram, Observer, Signal, Validation, internal,
};
use mailgate_queue::{MessageQueue, QueueMessage};
use tokio::sync::broadcast;

use crate::{error::DeliveryError, transport::MailTransport};

const DEFAULT_PREFETCH: u16 = 1;
const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Consumer {
    queue: Arc<dyn MessageQueue>,
    transport: Arc<dyn MailTransport>,
    observer: Arc<dyn Observer>,
    prefetch: u16,
    requeue_delay: Duration,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        transport: Arc<dyn MailTransport>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            queue,
            transport,
            observer,
            prefetch: DEFAULT_PREFETCH,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }

    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Pause before a failed message is returned to the queue
    #[must_use]
    pub const fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    /// Consume until `shutdown` fires. A message being handled when the
    /// signal arrives is settled first.
    ///
    /// # Errors
    /// If the subscription cannot be opened, fails, or ends.
    pub async fn run(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), DeliveryError> {
        let mut deliveries = self.queue.subscribe(self.prefetch).await?;
        internal!(level = INFO, "Delivery worker started (prefetch {})", self.prefetch);

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "Delivery worker received shutdown signal");
                        return Ok(());
                    }
                }

                next = deliveries.next() => match next {
                    Some(Ok(message)) => self.handle(message).await,
                    Some(Err(err)) => {
                        internal!(level = ERROR, "Delivery subscription failed: {err}");
                        return Err(err.into());
                    }
                    None => return Err(DeliveryError::SubscriptionEnded),
                },
            }
        }
    }

    /// Deliver and settle one message.
    #[tracing::instrument(level = "debug", skip_all, fields(tag = message.tag(), redelivered = message.redelivered()))]
    pub async fn handle(&self, message: QueueMessage) {
        let request = match Self::decode(message.payload()) {
            Ok(request) => request,
            Err(reason) => {
                internal!(level = ERROR, "Dropping undeliverable message: {reason}");
                self.observer.increment(Counter::EmailErrors);
                self.observer.increment(Counter::MessagesDropped);
                self.settle("reject", message.nack(false).await);
                return;
            }
        };

        let started = Instant::now();
        let result = self.transport.deliver(&request).await;
        self.observer
            .observe(Histogram::TransportDuration, started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                // An unacknowledged delivery comes back, so it is not a send yet.
                if !self.settle("acknowledge", message.ack().await) {
                    return;
                }
                self.observer.increment(Counter::EmailsSent);

                if let Some(queued_at) = request.queued_at {
                    let latency = (Utc::now() - queued_at).to_std().unwrap_or_default();
                    self.observer
                        .observe(Histogram::DeliveryLatency, latency.as_secs_f64());
                }

                internal!(
                    level = INFO,
                    "Email sent successfully to {:?}",
                    request.recipients
                );
            }
            Err(err) => {
                internal!(
                    level = ERROR,
                    "Error sending email: {err}; requeueing in {:?}",
                    self.requeue_delay
                );
                self.observer.increment(Counter::EmailErrors);

                tokio::time::sleep(self.requeue_delay).await;
                if self.settle("requeue", message.nack(true).await) {
                    self.observer.increment(Counter::MessagesRequeued);
                }
            }
        }
    }

    fn decode(payload: &[u8]) -> Result<EmailRequest, String> {
        let request: EmailRequest =
            serde_json::from_slice(payload).map_err(|err| format!("invalid JSON: {err}"))?;
        request
            .validate(Validation::Queued)
            .map_err(|err| err.to_string())?;
        Ok(request)
    }

    /// Whether the broker took the settlement.
    fn settle(&self, action: &str, result: mailgate_queue::Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                internal!(level = ERROR, "Failed to {action} message: {err}");
                self.observer.increment(Counter::SettleErrors);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mailgate_common::RecordingObserver;
    use mailgate_queue::MemoryQueue;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::recording::RecordingTransport;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        queue: MemoryQueue,
        transport: RecordingTransport,
        observer: RecordingObserver,
        shutdown: broadcast::Sender<Signal>,
        worker: tokio::task::JoinHandle<Result<(), DeliveryError>>,
    }

    impl Harness {
        fn start(transport: RecordingTransport) -> Self {
            let queue = MemoryQueue::new();
            let observer = RecordingObserver::new();
            let consumer = Consumer::new(
                Arc::new(queue.clone()),
                Arc::new(transport.clone()),
                Arc::new(observer.clone()),
            )
            .with_requeue_delay(Duration::from_millis(10));

            let (shutdown, receiver) = broadcast::channel(1);
            Self {
                queue,
                transport,
                observer,
                shutdown,
                worker: tokio::spawn(consumer.run(receiver)),
            }
        }

        async fn publish(&self, payload: &[u8]) {
            self.queue.publish(payload.to_vec()).await.unwrap();
        }

        async fn stop(self) {
            self.shutdown.send(Signal::Shutdown).unwrap();
            self.worker.await.unwrap().unwrap();
        }
    }

    fn request() -> Vec<u8> {
        serde_json::to_vec(
            &EmailRequest::new(["a@example.com"], "Hi", "Hello").queued(Utc::now()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn delivers_and_acknowledges() {
        let harness = Harness::start(RecordingTransport::new());
        harness.publish(&request()).await;

        assert!(harness.queue.wait_for_acked(1, WAIT).await);
        assert_eq!(harness.transport.delivered().len(), 1);
        assert_eq!(harness.observer.count(Counter::EmailsSent), 1);
        assert_eq!(harness.observer.samples(Histogram::DeliveryLatency).len(), 1);
        assert_eq!(harness.observer.samples(Histogram::TransportDuration).len(), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped() {
        let harness = Harness::start(RecordingTransport::new());
        harness.publish(b"{not json").await;

        assert!(harness.queue.wait_for_dropped(1, WAIT).await);
        assert_eq!(harness.transport.attempts(), 0);
        assert_eq!(harness.observer.count(Counter::EmailErrors), 1);
        assert_eq!(harness.observer.count(Counter::MessagesDropped), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn recipientless_payload_is_dropped() {
        let harness = Harness::start(RecordingTransport::new());
        harness
            .publish(br#"{"to":[],"subject":"Hi","body":"Hello"}"#)
            .await;

        assert!(harness.queue.wait_for_dropped(1, WAIT).await);
        assert_eq!(harness.transport.attempts(), 0);

        harness.stop().await;
    }

    #[tokio::test]
    async fn transient_failure_is_redelivered() {
        let harness = Harness::start(RecordingTransport::new().failing(2));
        harness.publish(&request()).await;

        assert!(harness.transport.wait_for_delivered(1, WAIT).await);
        assert!(harness.queue.wait_for_acked(1, WAIT).await);
        assert_eq!(harness.transport.attempts(), 3);
        assert_eq!(harness.queue.requeued(), 2);
        assert_eq!(harness.observer.count(Counter::MessagesRequeued), 2);
        assert_eq!(harness.observer.count(Counter::EmailErrors), 2);
        assert_eq!(harness.observer.count(Counter::EmailsSent), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn failed_ack_is_not_counted_as_sent() {
        let harness = Harness::start(RecordingTransport::new());
        harness.queue.fail_next_settlement("channel closed");
        harness.publish(&request()).await;

        assert!(harness.queue.wait_for_acked(1, WAIT).await);
        assert_eq!(harness.transport.delivered().len(), 2);
        assert_eq!(harness.observer.count(Counter::SettleErrors), 1);
        assert_eq!(harness.observer.count(Counter::EmailsSent), 1);
        assert_eq!(harness.observer.samples(Histogram::DeliveryLatency).len(), 1);

        harness.stop().await;
    }

    #[tokio::test]
    async fn every_message_is_settled() {
        let harness = Harness::start(RecordingTransport::new().failing(1));
        for _ in 0..3 {
            harness.publish(&request()).await;
        }
        harness.publish(b"garbage").await;

        assert!(harness.queue.wait_for_acked(3, WAIT).await);
        assert!(harness.queue.wait_for_dropped(1, WAIT).await);
        assert_eq!(harness.queue.len(), 0);
        assert_eq!(harness.queue.unacked(), 0);

        harness.stop().await;
    }

    #[tokio::test]
    async fn closed_queue_ends_subscription() {
        let harness = Harness::start(RecordingTransport::new());
        tokio::task::yield_now().await;
        harness.queue.close();

        let result = tokio::time::timeout(WAIT, harness.worker).await.unwrap();
        assert!(result.unwrap().is_err());
    }
}
