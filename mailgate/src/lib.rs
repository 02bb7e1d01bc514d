//! An authenticated TCP/TLS to SMTP relay gateway.
//!
//! Clients authenticate with a shared secret and submit JSON email requests.
//! Requests are queued durably and delivered by a worker over SMTP.

pub mod config;
pub mod error;
pub mod gateway;
pub mod notify;

pub use config::Config;
pub use error::NotifyError;
pub use gateway::{Gateway, Running};
pub use notify::{CertificateAction, CertificateNotifier, NotificationConfig};
