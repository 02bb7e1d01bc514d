//! Error types for the delivery worker.

use mailgate_common::error::ValidationError;
use mailgate_queue::QueueError;
use thiserror::Error;

/// Reasons a single email could not be handed to the mail server.
///
/// Every variant is treated as transient by the consumer: the message is
/// requeued and tried again.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A sender or recipient address does not parse.
    #[error("Invalid address {address:?}: {reason}")]
    Address { address: String, reason: String },

    /// The message could not be assembled.
    #[error("Failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    /// The SMTP exchange failed.
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// The transport refused to send for another reason.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

/// Errors that stop the delivery worker.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The queue closed the subscription.
    #[error("Subscription ended")]
    SubscriptionEnded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display() {
        let err = TransportError::Address {
            address: "not-an-address".to_string(),
            reason: "Missing domain or user".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid address \"not-an-address\": Missing domain or user"
        );

        assert_eq!(
            TransportError::from(ValidationError::NoRecipients).to_string(),
            "Recipient list is empty"
        );
    }

    #[test]
    fn delivery_error_display() {
        assert_eq!(
            DeliveryError::from(QueueError::Closed).to_string(),
            "Queue error: Queue is closed"
        );
    }
}
