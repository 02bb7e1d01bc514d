//! Observation points shared by the gateway components.
//!
//! Components receive an `Arc<dyn Observer>` and report what happened at
//! each transition. Observers never influence control flow.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Monotonic event counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    ConnectionsAccepted,
    AcceptErrors,
    HandshakeErrors,
    AuthSuccess,
    AuthFailure,
    EmailsQueued,
    EmailsSent,
    EmailErrors,
    MessagesRequeued,
    MessagesDropped,
    /// An ack or nack the broker did not take; the message will come back.
    SettleErrors,
    CertificateReloads,
    CertificateReloadErrors,
}

/// Values that move up and down or are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gauge {
    PlainConnections,
    TlsConnections,
    QueueDepth,
    CertificateExpiryDays,
}

/// Distributions, recorded in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Histogram {
    /// Time from acceptance onto the queue until the transport succeeded.
    DeliveryLatency,
    /// Time spent inside a single transport call.
    TransportDuration,
}

pub trait Observer: Send + Sync + std::fmt::Debug {
    /// Add one to `counter`
    fn increment(&self, counter: Counter);

    /// Move `gauge` by `delta`
    fn adjust(&self, gauge: Gauge, delta: f64);

    /// Replace the value of `gauge`
    fn set(&self, gauge: Gauge, value: f64);

    /// Record one sample of `histogram`
    fn observe(&self, histogram: Histogram, value: f64);
}

/// Discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn increment(&self, _counter: Counter) {}

    fn adjust(&self, _gauge: Gauge, _delta: f64) {}

    fn set(&self, _gauge: Gauge, _value: f64) {}

    fn observe(&self, _histogram: Histogram, _value: f64) {}
}

#[derive(Debug, Default)]
struct Recorded {
    counters: HashMap<Counter, u64>,
    gauges: HashMap<Gauge, f64>,
    histograms: HashMap<Histogram, Vec<f64>>,
}

/// Keeps every observation in memory so tests can assert on them.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    recorded: Arc<Mutex<Recorded>>,
    notify: Arc<Notify>,
}

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `counter`
    pub fn count(&self, counter: Counter) -> u64 {
        self.recorded
            .lock()
            .counters
            .get(&counter)
            .copied()
            .unwrap_or_default()
    }

    /// Current value of `gauge`, if it was ever touched
    pub fn gauge(&self, gauge: Gauge) -> Option<f64> {
        self.recorded.lock().gauges.get(&gauge).copied()
    }

    /// Every sample recorded for `histogram`, in order
    pub fn samples(&self, histogram: Histogram) -> Vec<f64> {
        self.recorded
            .lock()
            .histograms
            .get(&histogram)
            .cloned()
            .unwrap_or_default()
    }

    /// Wait until `counter` reaches at least `expected`.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn wait_for(&self, counter: Counter, expected: u64, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.count(counter) >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Wait until `gauge` satisfies `predicate`.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn wait_for_gauge<F>(&self, gauge: Gauge, predicate: F, timeout: Duration) -> bool
    where
        F: Fn(f64) -> bool,
    {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.gauge(gauge).is_some_and(&predicate) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

impl Observer for RecordingObserver {
    fn increment(&self, counter: Counter) {
        *self.recorded.lock().counters.entry(counter).or_default() += 1;
        self.notify.notify_waiters();
    }

    fn adjust(&self, gauge: Gauge, delta: f64) {
        *self.recorded.lock().gauges.entry(gauge).or_default() += delta;
        self.notify.notify_waiters();
    }

    fn set(&self, gauge: Gauge, value: f64) {
        self.recorded.lock().gauges.insert(gauge, value);
        self.notify.notify_waiters();
    }

    fn observe(&self, histogram: Histogram, value: f64) {
        self.recorded
            .lock()
            .histograms
            .entry(histogram)
            .or_default()
            .push(value);
        self.notify.notify_waiters();
    }
}
