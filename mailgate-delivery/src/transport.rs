use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use mailgate_common::{EmailRequest, Validation, internal};

use crate::{
    config::{Security, SmtpConfig},
    error::TransportError,
};

/// Sends one email on behalf of the delivery worker.
#[async_trait]
pub trait MailTransport: Send + Sync + std::fmt::Debug {
    /// Deliver `request` to every recipient in one message.
    ///
    /// # Errors
    /// If the message cannot be built or the mail server does not accept it.
    async fn deliver(&self, request: &EmailRequest) -> Result<(), TransportError>;
}

fn mailbox(address: &str) -> Result<Mailbox, TransportError> {
    address
        .parse()
        .map_err(|err: lettre::address::AddressError| TransportError::Address {
            address: address.to_string(),
            reason: err.to_string(),
        })
}

/// [`MailTransport`] over SMTP with a pooled `lettre` transport.
pub struct SmtpTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    host: String,
}

impl std::fmt::Debug for SmtpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpTransport")
            .field("host", &self.host)
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpTransport {
    /// Prepare a transport for `config`. No connection is made until the
    /// first delivery.
    ///
    /// # Errors
    /// If the sender address is invalid or TLS parameters cannot be built.
    pub fn new(config: &SmtpConfig) -> Result<Self, TransportError> {
        let from = mailbox(&config.from)?;

        let builder = match config.security() {
            Security::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?,
            Security::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            }
            Security::None => {
                internal!(
                    level = WARN,
                    "SMTP connection to {} is not encrypted",
                    config.host
                );
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
        };

        let mut builder = builder.port(config.port);
        if !config.user.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.user.clone(),
                config.password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            host: config.host.clone(),
        })
    }

    /// Build the MIME message for `request`.
    ///
    /// # Errors
    /// If the request has no recipients or an address does not parse.
    pub fn message(&self, request: &EmailRequest) -> Result<Message, TransportError> {
        request.validate(Validation::Queued)?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(request.subject.as_str())
            .header(ContentType::TEXT_HTML);

        for recipient in &request.recipients {
            builder = builder.to(mailbox(recipient)?);
        }

        Ok(builder.body(request.body.clone())?)
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    #[tracing::instrument(level = "debug", skip_all, fields(host = %self.host, recipients = request.recipients.len()))]
    async fn deliver(&self, request: &EmailRequest) -> Result<(), TransportError> {
        let message = self.message(request)?;
        let response = self.transport.send(message).await?;

        internal!(
            level = DEBUG,
            "{} accepted message: {}",
            self.host,
            response.code()
        );

        Ok(())
    }
}
