//! Listener configuration.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use mailgate_common::{
    config::{Environment, Section},
    error::{ConfigError, ConfigResult},
};
use serde::Deserialize;

/// How the gateway listens for clients.
///
/// ```ron
/// tcp: (
///     port: 9000,
///     auth_secret: "change-me",
///     tls: (
///         enabled: true,
///         certificate: "certs/server-cert.pem",
///         key: "certs/server-key.pem",
///     ),
/// ),
/// ```
#[derive(Clone, Deserialize)]
pub struct TcpConfig {
    /// Serve plaintext connections. Ignored when TLS is enabled.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    #[serde(default = "defaults::bind")]
    pub bind: IpAddr,

    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Shared secret every client must present first.
    #[serde(default)]
    pub auth_secret: String,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub timeouts: Timeouts,

    /// Largest frame accepted from a client, in bytes.
    ///
    /// Default: 65536
    #[serde(default = "defaults::max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl std::fmt::Debug for TcpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConfig")
            .field("enabled", &self.enabled)
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("timeouts", &self.timeouts)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            bind: defaults::bind(),
            port: defaults::port(),
            auth_secret: String::new(),
            tls: TlsConfig::default(),
            timeouts: Timeouts::default(),
            max_frame_bytes: defaults::max_frame_bytes(),
        }
    }
}

impl TcpConfig {
    pub const fn address(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Certificate material served in TLS mode.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// PEM certificate chain, leaf first.
    #[serde(default = "defaults::certificate")]
    pub certificate: PathBuf,

    /// PEM private key (PKCS#1, PKCS#8 or SEC1).
    #[serde(default = "defaults::key")]
    pub key: PathBuf,

    /// How often the certificate and key are checked for changes.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::reload_interval_secs")]
    pub reload_interval_secs: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            certificate: defaults::certificate(),
            key: defaults::key(),
            reload_interval_secs: defaults::reload_interval_secs(),
        }
    }
}

impl TlsConfig {
    pub const fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

/// Per-connection timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// Close a connection that sends nothing for this long.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::idle_secs")]
    pub idle_secs: u64,

    /// Close a connection that does not accept a reply within this long.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::write_secs")]
    pub write_secs: u64,

    /// How long a stopping listener waits for open connections to finish.
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::drain_secs")]
    pub drain_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            idle_secs: defaults::idle_secs(),
            write_secs: defaults::write_secs(),
            drain_secs: defaults::drain_secs(),
        }
    }
}

impl Timeouts {
    pub const fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub const fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub const fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

impl Section for TcpConfig {
    fn overlay(&mut self, env: &Environment) -> ConfigResult<()> {
        env.set_flag("TCP_ENABLED", &mut self.enabled)?;
        env.set("TCP_BIND", &mut self.bind)?;
        env.set("TCP_PORT", &mut self.port)?;
        env.set_string("TCP_AUTH_SECRET", &mut self.auth_secret);
        env.set("TCP_MAX_FRAME_BYTES", &mut self.max_frame_bytes)?;
        env.set("TCP_IDLE_TIMEOUT", &mut self.timeouts.idle_secs)?;

        env.set_flag("TCP_TLS_ENABLED", &mut self.tls.enabled)?;
        if let Some(path) = env.string("TCP_TLS_CERT_PATH") {
            self.tls.certificate = PathBuf::from(path);
        }
        if let Some(path) = env.string("TCP_TLS_KEY_PATH") {
            self.tls.key = PathBuf::from(path);
        }
        env.set("TCP_TLS_RELOAD_INTERVAL", &mut self.tls.reload_interval_secs)?;

        if self.tls.reload_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "TCP_TLS_RELOAD_INTERVAL",
                reason: "must be at least 1 second".to_string(),
            });
        }

        Ok(())
    }

    fn missing(&self) -> Vec<&'static str> {
        if self.auth_secret.is_empty() {
            vec!["TCP_AUTH_SECRET"]
        } else {
            Vec::new()
        }
    }
}

mod defaults {
    use std::{
        net::{IpAddr, Ipv4Addr},
        path::PathBuf,
    };

    pub const fn enabled() -> bool {
        true
    }

    pub const fn bind() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    pub const fn port() -> u16 {
        9000
    }

    pub fn certificate() -> PathBuf {
        PathBuf::from("certs/server-cert.pem")
    }

    pub fn key() -> PathBuf {
        PathBuf::from("certs/server-key.pem")
    }

    pub const fn reload_interval_secs() -> u64 {
        30
    }

    pub const fn max_frame_bytes() -> usize {
        64 * 1024
    }

    pub const fn idle_secs() -> u64 {
        300 // 5 minutes
    }

    pub const fn write_secs() -> u64 {
        30
    }

    pub const fn drain_secs() -> u64 {
        10
    }
}

/// Loopback address on an ephemeral port, for tests and local tools.
pub const LOOPBACK: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
