use anyhow::{Context, Result};
use lettre::{
    Message, SmtpTransport, Transport,
    message::{Mailbox, MultiPart},
    transport::smtp::{PoolConfig, authentication::Credentials},
};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::debug;

use super::{EmailMessage, EmailSender};

const SMTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    host: String,
    port: u16,
    username: String,
    password: SecretString,
    from_name: String,
}

impl SmtpConfig {
    #[must_use]
    pub fn new(host: String, username: String, password: SecretString) -> Self {
        Self {
            host,
            port: 587,
            username,
            password,
            from_name: "ZeroWork".to_string(),
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_from_name(mut self, from_name: String) -> Self {
        self.from_name = from_name;
        self
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Mailbox used as `From`: the display name over the authenticated account.
    ///
    /// # Errors
    /// Returns an error if the username is not a valid email address.
    pub fn from_mailbox(&self) -> Result<Mailbox> {
        let address = self
            .username
            .parse()
            .with_context(|| format!("invalid SMTP sender address: {}", self.username))?;
        Ok(Mailbox::new(Some(self.from_name.clone()), address))
    }
}

/// Delivers outbox messages through an authenticated STARTTLS relay.
#[derive(Clone)]
pub struct SmtpEmailSender {
    transport: SmtpTransport,
    from: Mailbox,
}

impl SmtpEmailSender {
    /// # Errors
    /// Returns an error if the sender address or relay host is invalid.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let from = config.from_mailbox()?;
        let transport = SmtpTransport::starttls_relay(config.host())
            .with_context(|| format!("failed to configure SMTP relay {}", config.host()))?
            .port(config.port())
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            ))
            .pool_config(PoolConfig::new().max_size(2))
            .timeout(Some(SMTP_TIMEOUT))
            .build();

        Ok(Self { transport, from })
    }
}

impl std::fmt::Debug for SmtpEmailSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpEmailSender")
            .field("from", &self.from.to_string())
            .finish_non_exhaustive()
    }
}

impl EmailSender for SmtpEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        let email = build_message(&self.from, message)?;
        self.transport
            .send(&email)
            .with_context(|| format!("SMTP delivery to {} failed", message.to_email))?;
        debug!(to_email = %message.to_email, subject = %message.subject, "email sent");
        Ok(())
    }
}

fn build_message(from: &Mailbox, message: &EmailMessage) -> Result<Message> {
    let to: Mailbox = message
        .to_email
        .parse()
        .with_context(|| format!("invalid recipient address: {}", message.to_email))?;

    let mut builder = Message::builder()
        .from(from.clone())
        .to(to)
        .subject(message.subject.clone());

    if let Some(reply_to) = &message.reply_to {
        let reply_to: Mailbox = reply_to
            .parse()
            .with_context(|| format!("invalid reply-to address: {reply_to}"))?;
        builder = builder.reply_to(reply_to);
    }

    builder
        .multipart(MultiPart::alternative_plain_html(
            message.text.clone(),
            message.html.clone(),
        ))
        .context("failed to build email message")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(reply_to: Option<&str>) -> EmailMessage {
        EmailMessage {
            to_email: "alice@example.com".to_string(),
            subject: "Hola".to_string(),
            text: "texto".to_string(),
            html: "<p>html</p>".to_string(),
            reply_to: reply_to.map(str::to_string),
        }
    }

    fn config() -> SmtpConfig {
        SmtpConfig::new(
            "smtp.gmail.com".to_string(),
            "noreply@zerowork.dev".to_string(),
            SecretString::from("app-password".to_string()),
        )
    }

    #[test]
    fn config_defaults_and_from_mailbox() -> Result<()> {
        let config = config().with_from_name("ZeroWork Team".to_string());
        assert_eq!(config.port(), 587);
        let from = config.from_mailbox()?;
        assert_eq!(from.name.as_deref(), Some("ZeroWork Team"));
        assert_eq!(from.email.to_string(), "noreply@zerowork.dev");
        Ok(())
    }

    #[test]
    fn config_debug_redacts_password() {
        let debug = format!("{:?}", config());
        assert!(!debug.contains("app-password"));
    }

    #[test]
    fn invalid_sender_address() {
        let config = SmtpConfig::new(
            "smtp.gmail.com".to_string(),
            "not-an-address".to_string(),
            SecretString::from("x".to_string()),
        );
        assert!(SmtpEmailSender::new(&config).is_err());
    }

    #[test]
    fn build_message_sets_headers() -> Result<()> {
        let from = config().from_mailbox()?;
        let email = build_message(&from, &message(Some("bob@example.com")))?;
        let formatted = String::from_utf8_lossy(&email.formatted()).to_string();
        assert!(formatted.contains("To: alice@example.com"));
        assert!(formatted.contains("Reply-To: bob@example.com"));
        assert!(formatted.contains("multipart/alternative"));
        Ok(())
    }

    #[test]
    fn build_message_rejects_bad_recipient() -> Result<()> {
        let from = config().from_mailbox()?;
        let mut message = message(None);
        message.to_email = "nope".to_string();
        assert!(build_message(&from, &message).is_err());
        Ok(())
    }
}
