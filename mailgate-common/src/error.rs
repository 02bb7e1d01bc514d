//! Error types shared by the mailgate crates.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors raised while assembling the runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more required settings were not provided.
    #[error("Missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    /// A setting was present but could not be interpreted.
    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    /// The configuration file could not be read.
    #[error("Failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid RON.
    #[error("Failed to parse config from {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// Neither a plaintext nor a TLS listener is enabled.
    #[error("At least one of plaintext or TLS listening must be enabled")]
    NoListenerEnabled,
}

/// Reasons an email request is refused before reaching the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Recipient list is empty")]
    NoRecipients,

    #[error("Subject is empty")]
    EmptySubject,

    #[error("Body is empty")]
    EmptyBody,
}

/// Errors that end a single gateway connection.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The TLS handshake with the peer failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// The peer violated the framing rules.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Reading from or writing to the peer failed.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// The peer sent nothing within the idle timeout.
    #[error("Session timed out after {0} seconds")]
    Timeout(u64),
}

impl SessionError {
    /// Returns `true` if the error was caused by the peer rather than the gateway.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::Protocol(_) | Self::Timeout(_)
        )
    }
}

/// Errors that stop a listener from serving.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to the configured address.
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The listener configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The TLS material could not be loaded at startup.
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// Specialized `Result` type for configuration assembly.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
