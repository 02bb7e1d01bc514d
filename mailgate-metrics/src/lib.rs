//! OpenTelemetry metrics for the mailgate relay gateway
//!
//! Observations made through [`mailgate_common::Observer`] are recorded on
//! OpenTelemetry instruments and pushed via OTLP to a collector, which can
//! expose them in Prometheus format for scraping.
//!
//! ```text
//! mailgate → OTLP/HTTP → OpenTelemetry Collector → Prometheus (scrape) → Grafana
//! ```

mod config;
mod error;
mod exporter;
mod observer;

use std::sync::Arc;

use mailgate_common::{NoopObserver, Observer, internal};
use opentelemetry::metrics::MeterProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;

pub use config::MetricsConfig;
pub use error::MetricsError;
pub use observer::{Description, OtelObserver, describe_counter, describe_gauge, describe_histogram};

/// The observer handed to every component, and the exporter feeding from it.
#[derive(Debug)]
pub struct Metrics {
    observer: Arc<dyn Observer>,
    provider: Option<SdkMeterProvider>,
}

impl Metrics {
    /// Record observations on `provider`'s instruments.
    pub fn from_provider(provider: SdkMeterProvider) -> Self {
        let observer = OtelObserver::new(&provider.meter("mailgate"));

        Self {
            observer: Arc::new(observer),
            provider: Some(provider),
        }
    }

    pub fn observer(&self) -> Arc<dyn Observer> {
        Arc::clone(&self.observer)
    }

    pub const fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Flush outstanding measurements and stop exporting.
    ///
    /// # Errors
    ///
    /// Returns an error if the final export fails.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        match self.provider {
            Some(provider) => provider
                .shutdown()
                .map_err(|e| MetricsError::Shutdown(e.to_string())),
            None => Ok(()),
        }
    }
}

/// Initialize the metrics system
///
/// If metrics are disabled in the config, observations are discarded.
///
/// # Errors
///
/// Returns an error if the OTLP exporter cannot be initialized.
pub fn init(config: &MetricsConfig) -> Result<Metrics, MetricsError> {
    if !config.enabled {
        internal!(level = INFO, "Metrics collection is disabled");
        return Ok(Metrics {
            observer: Arc::new(NoopObserver),
            provider: None,
        });
    }

    internal!(
        level = INFO,
        "Initializing OpenTelemetry metrics with OTLP exporter to {}",
        config.endpoint
    );

    let provider = exporter::init_otlp_exporter(&config.endpoint)?;
    Ok(Metrics::from_provider(provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_metrics_are_a_noop() {
        let metrics = init(&MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        })
        .unwrap();

        assert!(!metrics.is_enabled());
        metrics.observer().increment(mailgate_common::Counter::EmailsSent);
        metrics.shutdown().unwrap();
    }

    #[test]
    fn shutdown_stops_the_provider() {
        let provider = SdkMeterProvider::builder().build();
        let metrics = Metrics::from_provider(provider.clone());
        assert!(metrics.is_enabled());

        metrics.observer().increment(mailgate_common::Counter::EmailsQueued);
        let _ = metrics.shutdown();

        assert!(provider.shutdown().is_err());
    }
}
