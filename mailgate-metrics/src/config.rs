//! Metrics configuration

use mailgate_common::{
    config::{Environment, Section},
    error::ConfigResult,
};
use serde::Deserialize;

/// Configuration for metrics collection and export
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable or disable metrics collection
    ///
    /// When disabled, observations are discarded.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// OTLP endpoint URL for metrics export
    ///
    /// Common values:
    /// - `http://localhost:4318/v1/metrics` (local collector)
    /// - `http://otel-collector:4318/v1/metrics` (Docker Compose service name)
    #[serde(default = "defaults::endpoint")]
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            endpoint: defaults::endpoint(),
        }
    }
}

impl Section for MetricsConfig {
    fn overlay(&mut self, env: &Environment) -> ConfigResult<()> {
        env.set_flag("METRICS_ENABLED", &mut self.enabled)?;
        env.set_string("METRICS_ENDPOINT", &mut self.endpoint);
        Ok(())
    }
}

mod defaults {
    pub const fn enabled() -> bool {
        true
    }

    pub fn endpoint() -> String {
        "http://localhost:4318/v1/metrics".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_overrides() {
        let mut config = MetricsConfig::default();
        assert!(config.enabled);

        config
            .overlay(&Environment::from_pairs([
                ("METRICS_ENABLED", "no"),
                ("METRICS_ENDPOINT", "http://collector:4318/v1/metrics"),
            ]))
            .unwrap();

        assert!(!config.enabled);
        assert_eq!(config.endpoint, "http://collector:4318/v1/metrics");
    }

    #[test]
    fn parses_ron_block() {
        let config: MetricsConfig = ron::from_str("(enabled: false)").unwrap();
        assert!(!config.enabled);
        assert_eq!(config.endpoint, "http://localhost:4318/v1/metrics");
    }
}
