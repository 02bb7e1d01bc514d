use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use mailgate_common::EmailRequest;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{error::TransportError, transport::MailTransport};

#[derive(Debug, Default)]
struct Recorded {
    delivered: Vec<EmailRequest>,
    attempts: usize,
    failures_left: usize,
}

/// [`MailTransport`] that keeps every delivered request in memory.
///
/// It can be told to fail a number of deliveries first, to exercise retries.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    recorded: Arc<Mutex<Recorded>>,
    notify: Arc<Notify>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` deliveries
    #[must_use]
    pub fn failing(self, count: usize) -> Self {
        self.recorded.lock().failures_left = count;
        self
    }

    pub fn delivered(&self) -> Vec<EmailRequest> {
        self.recorded.lock().delivered.clone()
    }

    /// Deliveries attempted, failed or not
    pub fn attempts(&self) -> usize {
        self.recorded.lock().attempts
    }

    /// Wait until at least `expected` requests were delivered.
    pub async fn wait_for_delivered(&self, expected: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.recorded.lock().delivered.len() >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn deliver(&self, request: &EmailRequest) -> Result<(), TransportError> {
        let result = {
            let mut recorded = self.recorded.lock();
            recorded.attempts += 1;

            if recorded.failures_left > 0 {
                recorded.failures_left -= 1;
                Err(TransportError::Unavailable(format!(
                    "Simulated failure on attempt {}",
                    recorded.attempts
                )))
            } else {
                recorded.delivered.push(request.clone());
                Ok(())
            }
        };

        self.notify.notify_waiters();
        result
    }
}
