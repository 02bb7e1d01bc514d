use std::{sync::Arc, time::Duration};

use mailgate_common::{Gauge, Observer, Signal, internal};
use mailgate_queue::MessageQueue;
use tokio::{sync::broadcast, time::MissedTickBehavior};

/// Publishes the number of messages waiting in the queue.
///
/// Purely observational: a growing backlog does not slow producers down.
#[derive(Debug)]
pub struct BacklogSampler {
    queue: Arc<dyn MessageQueue>,
    observer: Arc<dyn Observer>,
    interval: Duration,
}

impl BacklogSampler {
    pub fn new(queue: Arc<dyn MessageQueue>, observer: Arc<dyn Observer>, interval: Duration) -> Self {
        Self {
            queue,
            observer,
            interval,
        }
    }

    /// Take one sample now.
    pub async fn sample(&self) {
        match self.queue.depth().await {
            Ok(depth) => self.observer.set(Gauge::QueueDepth, f64::from(depth)),
            Err(err) => internal!(level = WARN, "Failed to sample queue depth: {err}"),
        }
    }

    /// Sample every interval until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<Signal>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!("Backlog sampler stopping");
                        return;
                    }
                }

                _ = ticker.tick() => self.sample().await,
            }
        }
    }
}
