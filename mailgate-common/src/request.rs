//! The email request carried from a gateway connection to the delivery worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Which checks an [`EmailRequest`] must pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Accepting a request onto the queue only requires a recipient.
    Queued,
    /// Sending immediately also requires a subject and a body.
    Direct,
}

/// A request to send one email.
///
/// Decoding is lenient: absent fields become empty and unknown fields are
/// ignored, so shape problems surface through [`EmailRequest::validate`]
/// rather than as decode failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRequest {
    #[serde(rename = "to", default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    /// Stamped by the producer when the request is accepted onto the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
}

impl EmailRequest {
    /// Create a new request with no queue timestamp
    #[must_use]
    pub fn new<R, S>(recipients: R, subject: impl Into<String>, body: impl Into<String>) -> Self
    where
        R: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            recipients: recipients.into_iter().map(Into::into).collect(),
            subject: subject.into(),
            body: body.into(),
            queued_at: None,
        }
    }

    /// Check the request against the given policy.
    ///
    /// # Errors
    /// The first rule the request breaks.
    pub fn validate(&self, policy: Validation) -> Result<(), ValidationError> {
        if self.recipients.is_empty() {
            return Err(ValidationError::NoRecipients);
        }

        if policy == Validation::Direct {
            if self.subject.is_empty() {
                return Err(ValidationError::EmptySubject);
            }

            if self.body.is_empty() {
                return Err(ValidationError::EmptyBody);
            }
        }

        Ok(())
    }

    /// Mark the request as accepted onto the queue at `at`
    #[must_use]
    pub fn queued(mut self, at: DateTime<Utc>) -> Self {
        self.queued_at = Some(at);
        self
    }
}

/// The shared secret presented by a connecting client.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct AuthCredential {
    pub secret: String,
}

impl AuthCredential {
    /// Compare against the configured secret without short-circuiting on
    /// the first differing byte.
    pub fn matches(&self, expected: &str) -> bool {
        let (given, expected) = (self.secret.as_bytes(), expected.as_bytes());

        given.len() == expected.len()
            && given
                .iter()
                .zip(expected)
                .fold(0_u8, |acc, (lhs, rhs)| acc | (lhs ^ rhs))
                == 0
    }
}

impl std::fmt::Debug for AuthCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCredential")
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_wire_names() {
        let request: EmailRequest = serde_json::from_str(
            r#"{"to":["a@example.com","b@example.com"],"subject":"Hi","body":"Hello"}"#,
        )
        .unwrap();

        assert_eq!(
            request,
            EmailRequest::new(["a@example.com", "b@example.com"], "Hi", "Hello")
        );
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let request: EmailRequest = serde_json::from_str(r#"{"secret":"nope"}"#).unwrap();
        assert_eq!(request, EmailRequest::default());
    }

    #[test]
    fn queued_at_round_trips_as_rfc3339() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let request = EmailRequest::new(["a@example.com"], "s", "b").queued(at);

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""queued_at":"2024-05-01T12:30:00Z""#));
        assert!(json.contains(r#""to":["a@example.com"]"#));

        let back: EmailRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.queued_at, Some(at));
    }

    #[test]
    fn queued_policy_only_requires_recipients() {
        let request = EmailRequest::new(["a@example.com"], "", "");
        assert!(request.validate(Validation::Queued).is_ok());
        assert_eq!(
            request.validate(Validation::Direct),
            Err(ValidationError::EmptySubject)
        );

        let request = EmailRequest::new(["a@example.com"], "s", "");
        assert_eq!(
            request.validate(Validation::Direct),
            Err(ValidationError::EmptyBody)
        );
    }

    #[test]
    fn empty_recipients_rejected_by_both_policies() {
        let request = EmailRequest::new(Vec::<String>::new(), "x", "y");
        assert_eq!(
            request.validate(Validation::Queued),
            Err(ValidationError::NoRecipients)
        );
        assert_eq!(
            request.validate(Validation::Direct),
            Err(ValidationError::NoRecipients)
        );
    }

    #[test]
    fn credential_comparison() {
        let credential = AuthCredential {
            secret: "topsecret".to_string(),
        };

        assert!(credential.matches("topsecret"));
        assert!(!credential.matches("topsecreT"));
        assert!(!credential.matches("topsecret2"));
        assert!(!credential.matches(""));
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = AuthCredential {
            secret: "topsecret".to_string(),
        };

        let debug = format!("{credential:?}");
        assert!(!debug.contains("topsecret"));
    }
}
