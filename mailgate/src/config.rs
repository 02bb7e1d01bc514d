//! The gateway's full configuration tree.
//!
//! Built in three layers: serde defaults, then the optional RON file, then
//! environment variables. Every section reports its own unset required
//! values and they are returned together, so an operator sees the whole
//! list at once.

use mailgate_common::{
    config::{self, Environment, Section},
    error::{ConfigError, ConfigResult},
    internal,
};
use mailgate_delivery::SmtpConfig;
use mailgate_metrics::MetricsConfig;
use mailgate_queue::QueueConfig;
use mailgate_tcp::TcpConfig;
use serde::Deserialize;

use crate::notify::NotificationConfig;

/// ```ron
/// (
///     tcp: (port: 9000, auth_secret: "change-me"),
///     queue: (host: "rabbitmq", name: "email_queue"),
///     smtp: (host: "smtp.example.com", port: 587, user: "relay", password: "pw", from: "relay@example.com"),
///     metrics: (enabled: false),
///     notifications: (recipient: "ops@example.com"),
/// )
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tcp: TcpConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

impl Config {
    /// Assemble the configuration from the file named by `MAILGATE_CONFIG`
    /// (or a default location) and the given environment.
    ///
    /// # Errors
    /// If the file cannot be read or parsed, a variable holds a value that
    /// cannot be interpreted, or required values are missing.
    pub fn load(env: &Environment) -> ConfigResult<Self> {
        let mut config = match config::locate(env)? {
            Some(path) => {
                internal!(level = INFO, "Loading configuration from {}", path.display());
                config::read_file(&path)?
            }
            None => {
                internal!(
                    level = INFO,
                    "No configuration file found, using defaults and environment"
                );
                Self::default()
            }
        };

        config.overlay(env)?;

        let missing = config.missing();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        config.resolve();

        Ok(config)
    }

    /// Values derived from other sections once everything is known.
    fn resolve(&mut self) {
        if self.notifications.recipient.is_none() && !self.smtp.user.is_empty() {
            self.notifications.recipient = Some(self.smtp.user.clone());
        }
    }
}

impl Section for Config {
    fn overlay(&mut self, env: &Environment) -> ConfigResult<()> {
        self.tcp.overlay(env)?;
        self.queue.overlay(env)?;
        self.smtp.overlay(env)?;
        self.metrics.overlay(env)?;
        self.notifications.overlay(env)
    }

    fn missing(&self) -> Vec<&'static str> {
        let mut missing = self.tcp.missing();
        missing.extend(self.queue.missing());
        missing.extend(self.smtp.missing());
        missing.extend(self.metrics.missing());
        missing.extend(self.notifications.missing());
        missing
    }
}
