//! [`Observer`] backed by OpenTelemetry instruments.
//!
//! Related observation points share one instrument and are told apart by an
//! attribute, e.g. `mailgate.auth.attempts.total{outcome="failure"}`.
//! Gauges keep their current value locally so that relative adjustments can
//! be reported as absolute readings.

use std::collections::HashMap;

use mailgate_common::{Counter, Gauge, Histogram, Observer};
use opentelemetry::{
    KeyValue,
    metrics::{self, Meter},
};
use parking_lot::Mutex;

const COUNTERS: [Counter; 13] = [
    Counter::ConnectionsAccepted,
    Counter::AcceptErrors,
    Counter::HandshakeErrors,
    Counter::AuthSuccess,
    Counter::AuthFailure,
    Counter::EmailsQueued,
    Counter::EmailsSent,
    Counter::EmailErrors,
    Counter::MessagesRequeued,
    Counter::MessagesDropped,
    Counter::SettleErrors,
    Counter::CertificateReloads,
    Counter::CertificateReloadErrors,
];

const GAUGES: [Gauge; 4] = [
    Gauge::PlainConnections,
    Gauge::TlsConnections,
    Gauge::QueueDepth,
    Gauge::CertificateExpiryDays,
];

const HISTOGRAMS: [Histogram; 2] = [Histogram::DeliveryLatency, Histogram::TransportDuration];

/// Name, description and distinguishing attribute of one observation point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Description {
    pub name: &'static str,
    pub description: &'static str,
    pub attribute: Option<(&'static str, &'static str)>,
}

impl Description {
    const fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            attribute: None,
        }
    }

    const fn with(mut self, key: &'static str, value: &'static str) -> Self {
        self.attribute = Some((key, value));
        self
    }

    fn attributes(&self) -> Vec<KeyValue> {
        self.attribute
            .map(|(key, value)| KeyValue::new(key, value))
            .into_iter()
            .collect()
    }
}

pub const fn describe_counter(counter: Counter) -> Description {
    const AUTH: &str = "mailgate.auth.attempts.total";
    const AUTH_DESCRIPTION: &str = "Authentication attempts by outcome";
    const QUEUE: &str = "mailgate.queue.rejected.total";
    const QUEUE_DESCRIPTION: &str = "Messages rejected by the delivery worker, by outcome";
    const RELOADS: &str = "mailgate.tls.reloads.total";
    const RELOADS_DESCRIPTION: &str = "Certificate reload attempts by outcome";

    match counter {
        Counter::ConnectionsAccepted => Description::new(
            "mailgate.tcp.connections.total",
            "Total number of accepted client connections",
        ),
        Counter::AcceptErrors => Description::new(
            "mailgate.tcp.accept.errors.total",
            "Errors returned while accepting connections",
        ),
        Counter::HandshakeErrors => Description::new(
            "mailgate.tcp.handshake.errors.total",
            "TLS handshakes that failed or timed out",
        ),
        Counter::AuthSuccess => Description::new(AUTH, AUTH_DESCRIPTION).with("outcome", "success"),
        Counter::AuthFailure => Description::new(AUTH, AUTH_DESCRIPTION).with("outcome", "failure"),
        Counter::EmailsQueued => Description::new(
            "mailgate.emails.queued.total",
            "Email requests accepted onto the queue",
        ),
        Counter::EmailsSent => Description::new(
            "mailgate.emails.sent.total",
            "Emails accepted by the mail server",
        ),
        Counter::EmailErrors => Description::new(
            "mailgate.emails.errors.total",
            "Emails that failed to queue, decode or send",
        ),
        Counter::MessagesRequeued => {
            Description::new(QUEUE, QUEUE_DESCRIPTION).with("outcome", "requeued")
        }
        Counter::MessagesDropped => {
            Description::new(QUEUE, QUEUE_DESCRIPTION).with("outcome", "dropped")
        }
        Counter::SettleErrors => Description::new(
            "mailgate.queue.settle.errors.total",
            "Acknowledgments the broker did not accept",
        ),
        Counter::CertificateReloads => {
            Description::new(RELOADS, RELOADS_DESCRIPTION).with("outcome", "success")
        }
        Counter::CertificateReloadErrors => {
            Description::new(RELOADS, RELOADS_DESCRIPTION).with("outcome", "failure")
        }
    }
}

pub const fn describe_gauge(gauge: Gauge) -> Description {
    const ACTIVE: &str = "mailgate.tcp.connections.active";
    const ACTIVE_DESCRIPTION: &str = "Open client connections by transport";

    match gauge {
        Gauge::PlainConnections => {
            Description::new(ACTIVE, ACTIVE_DESCRIPTION).with("transport", "plain")
        }
        Gauge::TlsConnections => {
            Description::new(ACTIVE, ACTIVE_DESCRIPTION).with("transport", "tls")
        }
        Gauge::QueueDepth => Description::new(
            "mailgate.queue.depth",
            "Messages waiting in the delivery queue",
        ),
        Gauge::CertificateExpiryDays => Description::new(
            "mailgate.tls.certificate.expiry.days",
            "Days until the active server certificate expires",
        ),
    }
}

pub const fn describe_histogram(histogram: Histogram) -> Description {
    match histogram {
        Histogram::DeliveryLatency => Description::new(
            "mailgate.delivery.latency.seconds",
            "Time from queueing until the mail server accepted the email",
        ),
        Histogram::TransportDuration => Description::new(
            "mailgate.delivery.transport.duration.seconds",
            "Time spent in a single SMTP delivery",
        ),
    }
}

struct Instrument<T> {
    instrument: T,
    attributes: Vec<KeyValue>,
}

/// Observer that forwards every observation to OpenTelemetry.
pub struct OtelObserver {
    counters: HashMap<Counter, Instrument<metrics::Counter<u64>>>,
    gauges: HashMap<Gauge, Instrument<metrics::Gauge<f64>>>,
    histograms: HashMap<Histogram, metrics::Histogram<f64>>,
    values: Mutex<HashMap<Gauge, f64>>,
}

impl std::fmt::Debug for OtelObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelObserver")
            .field("values", &*self.values.lock())
            .finish_non_exhaustive()
    }
}

impl OtelObserver {
    /// Create every instrument on `meter`.
    pub fn new(meter: &Meter) -> Self {
        let mut counters = HashMap::new();
        let mut by_name: HashMap<&'static str, metrics::Counter<u64>> = HashMap::new();
        for counter in COUNTERS {
            let description = describe_counter(counter);
            let instrument = by_name
                .entry(description.name)
                .or_insert_with(|| {
                    meter
                        .u64_counter(description.name)
                        .with_description(description.description)
                        .build()
                })
                .clone();

            counters.insert(
                counter,
                Instrument {
                    instrument,
                    attributes: description.attributes(),
                },
            );
        }

        let mut gauges = HashMap::new();
        let mut by_name: HashMap<&'static str, metrics::Gauge<f64>> = HashMap::new();
        for gauge in GAUGES {
            let description = describe_gauge(gauge);
            let instrument = by_name
                .entry(description.name)
                .or_insert_with(|| {
                    meter
                        .f64_gauge(description.name)
                        .with_description(description.description)
                        .build()
                })
                .clone();

            gauges.insert(
                gauge,
                Instrument {
                    instrument,
                    attributes: description.attributes(),
                },
            );
        }

        let histograms = HISTOGRAMS
            .into_iter()
            .map(|histogram| {
                let description = describe_histogram(histogram);
                let instrument = meter
                    .f64_histogram(description.name)
                    .with_description(description.description)
                    .with_unit("s")
                    .build();
                (histogram, instrument)
            })
            .collect();

        Self {
            counters,
            gauges,
            histograms,
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Last value reported for `gauge`
    pub fn value(&self, gauge: Gauge) -> Option<f64> {
        self.values.lock().get(&gauge).copied()
    }

    fn record(&self, gauge: Gauge, value: f64) {
        if let Some(gauge) = self.gauges.get(&gauge) {
            gauge.instrument.record(value, &gauge.attributes);
        }
    }
}

impl Observer for OtelObserver {
    fn increment(&self, counter: Counter) {
        if let Some(counter) = self.counters.get(&counter) {
            counter.instrument.add(1, &counter.attributes);
        }
    }

    fn adjust(&self, gauge: Gauge, delta: f64) {
        let value = {
            let mut values = self.values.lock();
            let value = values.entry(gauge).or_default();
            *value += delta;
            *value
        };
        self.record(gauge, value);
    }

    fn set(&self, gauge: Gauge, value: f64) {
        self.values.lock().insert(gauge, value);
        self.record(gauge, value);
    }

    fn observe(&self, histogram: Histogram, value: f64) {
        if let Some(histogram) = self.histograms.get(&histogram) {
            histogram.record(value, &[]);
        }
    }
}
