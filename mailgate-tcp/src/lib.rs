//! TCP/TLS front door of the mailgate relay gateway.
//!
//! Clients connect, authenticate with a shared secret and then submit any
//! number of email requests as JSON objects. Each accepted request is handed
//! to a [`mailgate_queue::Publisher`] and answered with one JSON reply.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod session;
pub mod state;
pub mod tls;

pub use client::{GatewayClient, TlsOptions};
pub use codec::{Frame, FrameDecoder, Reply};
pub use config::{TcpConfig, Timeouts, TlsConfig};
pub use error::{ClientError, ConnectionError, DecodeError, TlsError};
pub use listener::Listener;
pub use session::{Session, SessionConfig};
pub use state::State;
pub use tls::{CertificateMaterial, CertificateStore};
