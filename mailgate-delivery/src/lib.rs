//! Delivery side of the mailgate relay gateway.
//!
//! A [`Consumer`] drains the durable queue through a [`MailTransport`], and a
//! [`BacklogSampler`] reports how far behind it is.

pub mod backlog;
pub mod config;
pub mod consumer;
pub mod error;
pub mod recording;
pub mod transport;

pub use backlog::BacklogSampler;
pub use config::{Security, SmtpConfig};
pub use consumer::Consumer;
pub use error::{DeliveryError, TransportError};
pub use recording::RecordingTransport;
pub use transport::{MailTransport, SmtpTransport};
