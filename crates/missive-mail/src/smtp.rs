//! SMTP relay adapter.
//!
//! Reply classes map directly onto the shared taxonomy: 4xx replies are
//! transient, 5xx replies permanent. Authentication rejections (530, 534,
//! 535) and mailbox rejections (550, 551, 553) get their own categories so
//! dead-letter records say which one it was.

use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, MultiPart},
    transport::smtp::{authentication::Credentials, Error as SmtpError},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use missive_core::DeliveryOutcome;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    message::parse_mailbox,
    EmailDispatcher, EmailMessage,
};

/// Transport security for the relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Plain connection. Local relays and test servers only.
    None,
    /// Upgrade with STARTTLS.
    #[default]
    StartTls,
    /// Implicit TLS from the first byte.
    Tls,
}

/// Relay connection settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    /// Relay host name.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Login user, if the relay requires auth.
    pub username: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Transport security.
    pub tls: SmtpTls,
    /// Per-command timeout.
    pub timeout: Duration,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            username: None,
            password: None,
            tls: SmtpTls::StartTls,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Adapter for an SMTP relay.
#[derive(Debug, Clone)]
pub struct SmtpDispatcher {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    timeout: Duration,
}

impl SmtpDispatcher {
    /// Builds the pooled transport. Does not connect yet.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let builder = match config.tls {
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
            SmtpTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| DeliveryError::configuration(format!("smtp relay: {e}")))?,
            SmtpTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| DeliveryError::configuration(format!("smtp relay: {e}")))?,
        };

        let mut builder = builder.port(config.port).timeout(Some(config.timeout));
        match (&config.username, &config.password) {
            (Some(user), Some(pass)) => {
                builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
            },
            (Some(_), None) | (None, Some(_)) => {
                return Err(DeliveryError::configuration(
                    "smtp username and password must be set together",
                ));
            },
            (None, None) => {},
        }

        Ok(Self { transport: builder.build(), host: config.host.clone(), timeout: config.timeout })
    }

    fn classify(&self, err: &SmtpError) -> DeliveryError {
        if err.is_timeout() {
            return DeliveryError::timeout(self.timeout);
        }
        let code = err.status().and_then(|code| code.to_string().parse::<u16>().ok());
        match code {
            Some(530 | 534 | 535) => DeliveryError::authentication(err.to_string()),
            Some(550 | 551 | 553) => DeliveryError::invalid_recipient(err.to_string()),
            Some(code) if err.is_permanent() => DeliveryError::rejected(code, err.to_string()),
            Some(code) if err.is_transient() => DeliveryError::server(code, err.to_string()),
            _ if err.is_client() => DeliveryError::configuration(err.to_string()),
            _ => DeliveryError::network(err.to_string()),
        }
    }
}

/// Converts a neutral message into a MIME message.
pub fn build_message(message: &EmailMessage) -> Result<Message> {
    let mailbox = |address: &str| {
        parse_mailbox(address).map_err(|e| DeliveryError::invalid_recipient(e.to_string()))
    };

    let mut builder = Message::builder().from(mailbox(&message.from)?).subject(&message.subject);
    for address in &message.to {
        builder = builder.to(mailbox(address)?);
    }
    for address in &message.cc {
        builder = builder.cc(mailbox(address)?);
    }
    for address in &message.bcc {
        builder = builder.bcc(mailbox(address)?);
    }
    if let Some(address) = &message.reply_to {
        builder = builder.reply_to(mailbox(address)?);
    }

    let built = match (&message.text, &message.html) {
        (Some(text), Some(html)) => {
            builder.multipart(MultiPart::alternative_plain_html(text.clone(), html.clone()))
        },
        (Some(text), None) => builder.header(ContentType::TEXT_PLAIN).body(text.clone()),
        (None, Some(html)) => builder.header(ContentType::TEXT_HTML).body(html.clone()),
        (None, None) => return Err(DeliveryError::invalid_message("message has no body")),
    };
    built.map_err(|e| DeliveryError::invalid_message(e.to_string()))
}

#[async_trait]
impl EmailDispatcher for SmtpDispatcher {
    async fn send(&self, message: &EmailMessage) -> DeliveryOutcome {
        let span = info_span!("smtp_send", host = %self.host, recipients = message.to.len());
        async {
            let mime = match build_message(message) {
                Ok(mime) => mime,
                Err(e) => return e.into(),
            };

            match self.transport.send(mime).await {
                Ok(response) => {
                    debug!(code = %response.code(), "smtp relay accepted message");
                    DeliveryOutcome::Success
                },
                Err(e) => {
                    let err = self.classify(&e);
                    warn!(error = %err, category = %err.category(), "smtp send failed");
                    err.into()
                },
            }
        }
        .instrument(span)
        .await
    }

    fn provider_name(&self) -> &'static str {
        "smtp"
    }
}
