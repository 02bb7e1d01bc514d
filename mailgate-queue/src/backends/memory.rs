use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use crate::{
    error::{QueueError, Result},
    message::{Acknowledge, QueueMessage},
    queue::{Deliveries, MessageQueue},
};

#[derive(Debug)]
struct Entry {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Entry>,
    next_tag: u64,
    unacked: usize,
    published: Vec<Vec<u8>>,
    acked: Vec<Vec<u8>>,
    dropped: Vec<Vec<u8>>,
    requeued: usize,
    fail_publish: Option<String>,
    fail_settle: Option<String>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn changed(&self) {
        self.notify.notify_waiters();
    }

    fn settle(&self, payload: Vec<u8>, outcome: Settlement) {
        {
            let mut state = self.state.lock();
            state.unacked = state.unacked.saturating_sub(1);

            match outcome {
                Settlement::Ack => state.acked.push(payload),
                Settlement::Drop => state.dropped.push(payload),
                Settlement::Requeue => {
                    state.requeued += 1;
                    state.ready.push_front(Entry {
                        payload,
                        redelivered: true,
                    });
                }
            }
        }

        self.changed();
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Drop,
    Requeue,
}

/// In-process queue with broker-like acknowledgment semantics.
///
/// Rejected messages with `requeue` go back to the head of the queue and are
/// flagged as redelivered; those without are recorded as dropped. A message
/// that is dropped unsettled is requeued, as a broker does when a consumer's
/// channel closes. Each subscription enforces its own prefetch window.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following publish fail with `reason`, or succeed again with `None`
    pub fn fail_publishes(&self, reason: Option<&str>) {
        self.inner.state.lock().fail_publish = reason.map(str::to_string);
    }

    /// Make the next ack or nack fail with `reason`. The message it was meant
    /// for is requeued, as after a lost channel.
    pub fn fail_next_settlement(&self, reason: &str) {
        self.inner.state.lock().fail_settle = Some(reason.to_string());
    }

    /// End every subscription once its ready messages are exhausted
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.changed();
    }

    /// Messages waiting for delivery
    pub fn len(&self) -> usize {
        self.inner.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivered messages that have not been settled yet
    pub fn unacked(&self) -> usize {
        self.inner.state.lock().unacked
    }

    /// Every payload accepted by `publish`, in order
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().published.clone()
    }

    /// Payloads removed by an acknowledgment
    pub fn acked(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().acked.clone()
    }

    /// Payloads rejected without requeue
    pub fn dropped(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().dropped.clone()
    }

    /// Number of rejections that returned a message to the queue
    pub fn requeued(&self) -> usize {
        self.inner.state.lock().requeued
    }

    /// Wait until at least `expected` messages were acknowledged
    pub async fn wait_for_acked(&self, expected: usize, timeout: Duration) -> bool {
        self.wait_until(|state| state.acked.len() >= expected, timeout)
            .await
    }

    /// Wait until at least `expected` messages were dropped
    pub async fn wait_for_dropped(&self, expected: usize, timeout: Duration) -> bool {
        self.wait_until(|state| state.dropped.len() >= expected, timeout)
            .await
    }

    /// Wait until at least `expected` messages were published
    pub async fn wait_for_published(&self, expected: usize, timeout: Duration) -> bool {
        self.wait_until(|state| state.published.len() >= expected, timeout)
            .await
    }

    async fn wait_until<F>(&self, condition: F, timeout: Duration) -> bool
    where
        F: Fn(&State) -> bool,
    {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.notify.notified();
                if condition(&self.inner.state.lock()) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    async fn next_delivery(inner: Arc<Inner>, window: Arc<Semaphore>) -> Option<QueueMessage> {
        let permit = window.acquire_owned().await.ok()?;

        loop {
            let notified = inner.notify.notified();

            {
                let mut state = inner.state.lock();
                if let Some(entry) = state.ready.pop_front() {
                    state.next_tag += 1;
                    state.unacked += 1;
                    let tag = state.next_tag;
                    drop(state);

                    let acker = MemoryAcker {
                        inner: Arc::clone(&inner),
                        payload: Mutex::new(Some(entry.payload.clone())),
                        settled: AtomicBool::new(false),
                        _permit: permit,
                    };

                    return Some(QueueMessage::new(tag, entry.redelivered, entry.payload, acker));
                }

                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }

            if let Some(reason) = &state.fail_publish {
                return Err(QueueError::Unavailable(reason.clone()));
            }

            state.published.push(payload.clone());
            state.ready.push_back(Entry {
                payload,
                redelivered: false,
            });
        }

        self.inner.changed();
        Ok(())
    }

    async fn subscribe(&self, prefetch: u16) -> Result<Deliveries> {
        let window = Arc::new(Semaphore::new(usize::from(prefetch.max(1))));
        let inner = Arc::clone(&self.inner);

        Ok(futures_util::stream::unfold((inner, window), |(inner, window)| async move {
            let message = Self::next_delivery(Arc::clone(&inner), Arc::clone(&window)).await?;
            Some((Ok(message), (inner, window)))
        })
        .boxed())
    }

    async fn depth(&self) -> Result<u32> {
        Ok(u32::try_from(self.len()).unwrap_or(u32::MAX))
    }
}

/// Settles one delivery and releases its prefetch slot when dropped.
struct MemoryAcker {
    inner: Arc<Inner>,
    payload: Mutex<Option<Vec<u8>>>,
    settled: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn try_settle(&self, outcome: Settlement) -> Result<()> {
        let failure = self.inner.state.lock().fail_settle.take();
        if let Some(reason) = failure {
            return Err(QueueError::Unavailable(reason));
        }

        self.settle(outcome);
        Ok(())
    }

    fn settle(&self, outcome: Settlement) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(payload) = self.payload.lock().take() {
            self.inner.settle(payload, outcome);
        }
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.try_settle(Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.try_settle(if requeue {
            Settlement::Requeue
        } else {
            Settlement::Drop
        })
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.settle(Settlement::Requeue);
    }
}
