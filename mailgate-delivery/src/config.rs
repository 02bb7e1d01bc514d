//! Outbound SMTP settings.

use std::str::FromStr;

use mailgate_common::{
    config::{Environment, Section},
    error::ConfigResult,
};
use serde::Deserialize;

/// How the connection to the mail server is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// Plaintext connection upgraded with STARTTLS.
    StartTls,
    /// TLS from the first byte.
    Tls,
    /// No encryption. Only for local relays and tests.
    None,
}

impl FromStr for Security {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "starttls" => Ok(Self::StartTls),
            "tls" | "ssl" => Ok(Self::Tls),
            "none" | "plain" => Ok(Self::None),
            other => Err(format!("unknown security mode {other:?}")),
        }
    }
}

/// The mail server every email is relayed through.
///
/// ```ron
/// smtp: (
///     host: "smtp.example.com",
///     port: 587,
///     user: "relay@example.com",
///     password: "app-password",
///     from: "Mailgate <relay@example.com>",
/// ),
/// ```
#[derive(Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "defaults::host")]
    pub host: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// `From` header of every relayed email.
    #[serde(default)]
    pub from: String,

    /// Defaults to [`Security::Tls`] on port 465, [`Security::StartTls`] otherwise.
    #[serde(default)]
    pub security: Option<Security>,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("from", &self.from)
            .field("security", &self.security())
            .finish_non_exhaustive()
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            user: String::new(),
            password: String::new(),
            from: String::new(),
            security: None,
        }
    }
}

impl SmtpConfig {
    pub fn security(&self) -> Security {
        self.security.unwrap_or(if self.port == 465 {
            Security::Tls
        } else {
            Security::StartTls
        })
    }
}

impl Section for SmtpConfig {
    fn overlay(&mut self, env: &Environment) -> ConfigResult<()> {
        env.set_string("SMTP_HOST", &mut self.host);
        env.set("SMTP_PORT", &mut self.port)?;
        env.set_string("SMTP_USER", &mut self.user);
        env.set_string("SMTP_PASSWORD", &mut self.password);
        env.set_string("SMTP_FROM", &mut self.from);

        if let Some(security) = env.parse("SMTP_SECURITY")? {
            self.security = Some(security);
        }

        Ok(())
    }

    fn missing(&self) -> Vec<&'static str> {
        [
            ("SMTP_USER", &self.user),
            ("SMTP_PASSWORD", &self.password),
            ("SMTP_FROM", &self.from),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

mod defaults {
    pub fn host() -> String {
        "smtp.gmail.com".to_string()
    }

    pub const fn port() -> u16 {
        587
    }
}

#[cfg(test)]
mod tests {
    use mailgate_common::error::ConfigError;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_require_credentials() {
        let config = SmtpConfig::default();
        assert_eq!(config.host, "smtp.gmail.com");
        assert_eq!(config.security(), Security::StartTls);
        assert_eq!(
            config.missing(),
            vec!["SMTP_USER", "SMTP_PASSWORD", "SMTP_FROM"]
        );
    }

    #[test]
    fn port_465_implies_tls() {
        let mut config = SmtpConfig::default();
        config
            .overlay(&Environment::from_pairs([("SMTP_PORT", "465")]))
            .unwrap();
        assert_eq!(config.security(), Security::Tls);

        config
            .overlay(&Environment::from_pairs([("SMTP_SECURITY", "none")]))
            .unwrap();
        assert_eq!(config.security(), Security::None);
    }

    #[test]
    fn environment_overrides() {
        let mut config = SmtpConfig::default();
        config
            .overlay(&Environment::from_pairs([
                ("SMTP_HOST", "mail.example.com"),
                ("SMTP_USER", "relay@example.com"),
                ("SMTP_PASSWORD", "hunter2"),
                ("SMTP_FROM", "relay@example.com"),
            ]))
            .unwrap();

        assert_eq!(config.host, "mail.example.com");
        assert!(config.missing().is_empty());
        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[test]
    fn unknown_security_is_invalid() {
        let mut config = SmtpConfig::default();
        let err = config
            .overlay(&Environment::from_pairs([("SMTP_SECURITY", "maybe")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "SMTP_SECURITY",
                ..
            }
        ));
    }

    #[test]
    fn parses_ron_block() {
        let config: SmtpConfig =
            ron::from_str(r#"(host: "localhost", port: 2525, security: Some(none))"#).unwrap();
        assert_eq!(config.security(), Security::None);
        assert_eq!(config.port, 2525);
    }
}
