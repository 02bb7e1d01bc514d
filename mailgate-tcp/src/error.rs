//! Error types for the mailgate-tcp crate.
//!
//! Covers frame decoding, connection I/O and TLS material handling.

use std::io;

use mailgate_common::error::SessionError;
use thiserror::Error;

/// Reasons a received frame could not be turned into a request.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes are not a JSON object.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// The object does not have the fields its kind requires.
    #[error("Unexpected frame shape: {0}")]
    Shape(#[from] serde_json::Error),

    /// The `type` discriminator names an unknown kind.
    #[error("Unknown frame type {0:?}")]
    UnknownType(String),

    /// An explicitly tagged authentication frame arrived after authentication.
    #[error("Connection is already authenticated")]
    AlreadyAuthenticated,

    /// A frame grew past the configured limit before it was complete.
    #[error("Frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Errors that can occur during connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error during connection operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A reply could not be serialized.
    #[error("Failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),

    /// The peer did not accept a reply in time.
    #[error("Write timed out after {0} seconds")]
    WriteTimeout(u64),
}

impl From<ConnectionError> for SessionError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Io(err) => Self::Connection(err),
            ConnectionError::WriteTimeout(secs) => Self::Timeout(secs),
            ConnectionError::Encode(err) => Self::Protocol(err.to_string()),
        }
    }
}

/// Errors that can occur while loading or using TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    /// I/O error during TLS operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to load the TLS certificate chain.
    #[error("Failed to load TLS certificate from {path}: {reason}")]
    CertificateLoad { path: String, reason: String },

    /// Failed to load the TLS private key.
    #[error("Failed to load TLS private key from {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// The leaf certificate is not well-formed X.509.
    #[error("Invalid certificate in {path}: {reason}")]
    InvalidCertificate { path: String, reason: String },

    /// The TLS handshake with a peer failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Rustls library error.
    #[error("TLS error: {0}")]
    Rustls(String),
}

impl From<tokio_rustls::rustls::Error> for TlsError {
    fn from(err: tokio_rustls::rustls::Error) -> Self {
        Self::Rustls(err.to_string())
    }
}

/// Errors returned by [`crate::client::GatewayClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("Invalid server name {0:?}")]
    ServerName(String),

    #[error("Server closed the connection")]
    Closed,

    #[error("Invalid reply from server: {0}")]
    Reply(#[from] DecodeError),
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        Self::Connection(ConnectionError::Io(err))
    }
}

/// Specialized `Result` type for connection operations.
pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// Specialized `Result` type for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;
