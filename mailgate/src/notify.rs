//! Certificate notifications.
//!
//! Whatever provisions the gateway's certificates drops a small JSON file
//! next to them when it generates or renews one:
//!
//! ```json
//! {"action": "RENEWED", "timestamp": "2024-05-01T12:00:00Z", "certificate_path": "certs/ca-cert.pem"}
//! ```
//!
//! The watcher mails the CA certificate to the configured recipient through
//! the normal queue, then removes the file.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use chrono::Utc;
use mailgate_common::{
    EmailRequest, Signal, Validation,
    config::{Environment, Section},
    error::{ConfigError, ConfigResult},
    internal,
};
use mailgate_queue::{PublishError, Publisher};
use serde::Deserialize;
use tokio::{sync::broadcast, time::MissedTickBehavior};

use crate::error::NotifyError;

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Who receives certificate emails. Falls back to the SMTP user.
    #[serde(default)]
    pub recipient: Option<String>,

    /// The notification file to watch.
    #[serde(default = "defaults::path")]
    pub path: PathBuf,

    /// CA certificate sent when a notification does not name one.
    #[serde(default = "defaults::ca_certificate")]
    pub ca_certificate: PathBuf,

    /// Default: 10 seconds
    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            recipient: None,
            path: defaults::path(),
            ca_certificate: defaults::ca_certificate(),
            poll_interval_secs: defaults::poll_interval_secs(),
        }
    }
}

impl NotificationConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Section for NotificationConfig {
    fn overlay(&mut self, env: &Environment) -> ConfigResult<()> {
        if let Some(recipient) = env.string("CERTIFICATE_EMAIL_RECIPIENT") {
            self.recipient = Some(recipient);
        }
        if let Some(path) = env.string("CERTIFICATE_NOTIFICATION_PATH") {
            self.path = PathBuf::from(path);
        }

        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "notifications.poll_interval_secs",
                reason: "must be at least 1 second".to_string(),
            });
        }

        Ok(())
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn path() -> PathBuf {
        PathBuf::from("certs/certificate_notification.json")
    }

    pub fn ca_certificate() -> PathBuf {
        PathBuf::from("certs/ca-cert.pem")
    }

    pub const fn poll_interval_secs() -> u64 {
        10
    }
}

/// What happened to the certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateAction {
    Generated,
    Renewed,
}

impl CertificateAction {
    /// Anything other than a renewal is reported as a new certificate.
    fn from_tag(tag: &str) -> Self {
        if tag.eq_ignore_ascii_case("RENEWED") {
            Self::Renewed
        } else {
            Self::Generated
        }
    }

    pub const fn subject(self) -> &'static str {
        match self {
            Self::Generated => "Mailgate TLS certificate generated",
            Self::Renewed => "Mailgate TLS certificate renewed",
        }
    }

    const fn notice(self) -> &'static str {
        match self {
            Self::Generated => {
                "A TLS certificate was generated for the gateway. Clients can now \
                 connect securely by trusting the CA certificate below."
            }
            Self::Renewed => {
                "The gateway certificate was renewed automatically and the previous \
                 one will expire soon. Update client applications with the CA \
                 certificate below to avoid connection failures."
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(default)]
    action: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    certificate_path: Option<PathBuf>,
}

/// Turns notification files into queued emails.
#[derive(Debug)]
pub struct CertificateNotifier {
    recipient: String,
    config: NotificationConfig,
    publisher: Publisher,
    seen: Option<SystemTime>,
}

impl CertificateNotifier {
    pub fn new(recipient: impl Into<String>, config: NotificationConfig, publisher: Publisher) -> Self {
        Self {
            recipient: recipient.into(),
            config,
            publisher,
            seen: None,
        }
    }

    /// Process the notification file if it appeared or changed since the
    /// last check. Returns whether an email was queued.
    ///
    /// A file that fails is not retried until it changes again.
    ///
    /// # Errors
    /// If the notification or CA certificate cannot be read, the
    /// notification is not valid JSON, or the queue refuses the email.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %self.config.path.display()))]
    pub async fn check(&mut self) -> Result<bool, NotifyError> {
        let path = self.config.path.clone();

        let modified = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata
                .modified()
                .map_err(|source| NotifyError::Read { path: path.clone(), source })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.seen = None;
                return Ok(false);
            }
            Err(source) => return Err(NotifyError::Read { path, source }),
        };

        if self.seen == Some(modified) {
            return Ok(false);
        }
        self.seen = Some(modified);

        let notification: Notification = serde_json::from_slice(&read(&path).await?)?;
        let action = CertificateAction::from_tag(&notification.action);

        internal!(
            level = INFO,
            "Processing certificate notification: {action:?}"
        );

        let request = self.compose(action, &notification).await?;
        self.publisher.publish(request).await?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => self.seen = None,
            Err(err) => internal!(
                level = WARN,
                "Unable to remove {}: {err}",
                path.display()
            ),
        }

        internal!(
            level = INFO,
            "Certificate email queued for {}",
            self.recipient
        );

        Ok(true)
    }

    async fn compose(
        &self,
        action: CertificateAction,
        notification: &Notification,
    ) -> Result<EmailRequest, NotifyError> {
        let ca_path = notification
            .certificate_path
            .as_deref()
            .unwrap_or(&self.config.ca_certificate);

        let certificate = String::from_utf8_lossy(&read(ca_path).await?).trim().to_string();
        let issued = notification
            .timestamp
            .clone()
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        let request = EmailRequest::new(
            [self.recipient.as_str()],
            action.subject(),
            body(action, &issued, &certificate),
        );
        request
            .validate(Validation::Direct)
            .map_err(PublishError::from)?;

        Ok(request)
    }

    /// Check every poll interval until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<Signal>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        internal!(
            level = DEBUG,
            "Watching {} every {:?}",
            self.config.path.display(),
            self.config.poll_interval()
        );

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!("Certificate notification watcher stopping");
                        return;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(err) = self.check().await {
                        internal!(
                            level = ERROR,
                            "Failed to send certificate email: {err}"
                        );
                    }
                }
            }
        }
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, NotifyError> {
    tokio::fs::read(path).await.map_err(|source| NotifyError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn body(action: CertificateAction, issued: &str, certificate: &str) -> String {
    format!(
        "<html>\n<body style=\"font-family: sans-serif; max-width: 720px;\">\n\
         <h1>{subject}</h1>\n\
         <p>{notice}</p>\n\
         <p><strong>Issued:</strong> {issued}</p>\n\
         <p>Install this CA certificate in every client that connects to the gateway:</p>\n\
         <pre style=\"background: #f4f4f4; padding: 12px;\">{certificate}</pre>\n\
         </body>\n</html>\n",
        subject = action.subject(),
        notice = action.notice(),
        issued = escape(issued),
        certificate = escape(certificate),
    )
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    escaped
}
