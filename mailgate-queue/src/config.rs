use std::time::Duration;

use mailgate_common::{
    config::{Environment, Section},
    error::ConfigResult,
};
use serde::Deserialize;

/// Broker connection and queue behaviour
///
/// ```ron
/// queue: (
///     host: "rabbitmq",
///     user: "mailgate",
///     password: "secret",
///     prefetch: 1,
/// ),
/// ```
#[derive(Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "defaults::host")]
    pub host: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    #[serde(default = "defaults::credential")]
    pub user: String,

    #[serde(default = "defaults::credential")]
    pub password: String,

    #[serde(default = "defaults::vhost")]
    pub vhost: String,

    /// Name of the durable queue shared by producers and the consumer.
    #[serde(default = "defaults::name")]
    pub name: String,

    /// Unacknowledged messages the consumer may hold at once.
    ///
    /// Default: 1
    #[serde(default = "defaults::prefetch")]
    pub prefetch: u16,

    /// How often the backlog depth is sampled.
    ///
    /// Default: 15 seconds
    #[serde(default = "defaults::backlog_interval_secs")]
    pub backlog_interval_secs: u64,

    /// Pause before a failed delivery is returned to the queue.
    ///
    /// Default: 1000 milliseconds
    #[serde(default = "defaults::requeue_delay_ms")]
    pub requeue_delay_ms: u64,
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("vhost", &self.vhost)
            .field("name", &self.name)
            .field("prefetch", &self.prefetch)
            .finish_non_exhaustive()
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            user: defaults::credential(),
            password: defaults::credential(),
            vhost: defaults::vhost(),
            name: defaults::name(),
            prefetch: defaults::prefetch(),
            backlog_interval_secs: defaults::backlog_interval_secs(),
            requeue_delay_ms: defaults::requeue_delay_ms(),
        }
    }
}

impl QueueConfig {
    /// AMQP URI for the broker, with the virtual host percent-encoded
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('/', "%2f")
        )
    }

    pub const fn backlog_interval(&self) -> Duration {
        Duration::from_secs(self.backlog_interval_secs)
    }

    pub const fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

impl Section for QueueConfig {
    fn overlay(&mut self, env: &Environment) -> ConfigResult<()> {
        env.set_string("RABBITMQ_HOST", &mut self.host);
        env.set("RABBITMQ_PORT", &mut self.port)?;
        env.set_string("RABBITMQ_USER", &mut self.user);
        env.set_string("RABBITMQ_PASSWORD", &mut self.password);
        env.set_string("RABBITMQ_VHOST", &mut self.vhost);
        env.set_string("QUEUE_NAME", &mut self.name);
        env.set("QUEUE_PREFETCH", &mut self.prefetch)?;
        env.set("QUEUE_BACKLOG_INTERVAL", &mut self.backlog_interval_secs)?;
        env.set("QUEUE_REQUEUE_DELAY_MS", &mut self.requeue_delay_ms)?;

        if self.prefetch == 0 {
            return Err(mailgate_common::error::ConfigError::Invalid {
                name: "QUEUE_PREFETCH",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

mod defaults {
    pub fn host() -> String {
        "localhost".to_string()
    }

    pub const fn port() -> u16 {
        5672
    }

    pub fn credential() -> String {
        "admin".to_string()
    }

    pub fn vhost() -> String {
        "/".to_string()
    }

    pub fn name() -> String {
        "email_queue".to_string()
    }

    pub const fn prefetch() -> u16 {
        1
    }

    pub const fn backlog_interval_secs() -> u64 {
        15
    }

    pub const fn requeue_delay_ms() -> u64 {
        1000
    }
}
