//! Provider-neutral email message.

use lettre::message::Mailbox;
use missive_core::ValidationError;
use serde::{Deserialize, Serialize};

/// An email ready to hand to any adapter.
///
/// Addresses are kept as strings in `Name <local@domain>` or bare form and
/// parsed on [`validate`](Self::validate), so every adapter sees the same
/// accepted set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Sender mailbox.
    pub from: String,
    /// Primary recipients.
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    #[serde(default)]
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients.
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Reply-to mailbox.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    #[serde(default)]
    pub text: Option<String>,
    /// HTML body.
    #[serde(default)]
    pub html: Option<String>,
}

impl EmailMessage {
    /// Starts a message with no recipients and no body.
    pub fn new(from: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: None,
            subject: subject.into(),
            text: None,
            html: None,
        }
    }

    /// Adds a primary recipient.
    #[must_use]
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    /// Adds a carbon-copy recipient.
    #[must_use]
    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.cc.push(address.into());
        self
    }

    /// Adds a blind carbon-copy recipient.
    #[must_use]
    pub fn bcc(mut self, address: impl Into<String>) -> Self {
        self.bcc.push(address.into());
        self
    }

    /// Sets the reply-to mailbox.
    #[must_use]
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Sets the plain-text body.
    #[must_use]
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.text = Some(body.into());
        self
    }

    /// Sets the HTML body.
    #[must_use]
    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.html = Some(body.into());
        self
    }

    /// Every recipient across to, cc and bcc.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to.iter().chain(&self.cc).chain(&self.bcc).map(String::as_str)
    }

    /// Checks the message is deliverable in principle.
    ///
    /// Requires a recipient, a subject, a body and parseable addresses.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.to.is_empty() {
            return Err(self.invalid("at least one recipient is required"));
        }
        if self.subject.trim().is_empty() {
            return Err(self.invalid("subject must not be empty"));
        }
        let has_text = self.text.as_deref().is_some_and(|body| !body.is_empty());
        let has_html = self.html.as_deref().is_some_and(|body| !body.is_empty());
        if !has_text && !has_html {
            return Err(self.invalid("a text or html body is required"));
        }

        parse_mailbox(&self.from)?;
        for address in self.recipients().chain(self.reply_to.as_deref()) {
            parse_mailbox(address)?;
        }
        Ok(())
    }

    fn invalid(&self, message: &str) -> ValidationError {
        ValidationError::InvalidPayload { job_type: "email".into(), message: message.into() }
    }
}

/// Parses a `Name <local@domain>` or bare address.
pub fn parse_mailbox(address: &str) -> Result<Mailbox, ValidationError> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|e| ValidationError::invalid_address(address, e.to_string()))
}
