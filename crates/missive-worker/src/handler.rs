//! Job-type routing.
//!
//! A [`JobHandler`] turns one job type's payload into an [`EmailMessage`]
//! and is the only place that knows that type's schema. The
//! [`HandlerRegistry`] maps job types to handlers; a type without an entry
//! is a validation failure.

use std::{collections::HashMap, fmt::Write as _, sync::Arc};

use missive_core::{Job, JobType, ValidationError};
use missive_mail::EmailMessage;
use serde::{de::DeserializeOwned, Deserialize};

/// Builds the email for one job type.
pub trait JobHandler: Send + Sync + std::fmt::Debug {
    /// Job type this handler is registered under.
    fn job_type(&self) -> JobType;

    /// Parses and validates the payload.
    ///
    /// # Errors
    ///
    /// Any schema or address problem. These are always permanent.
    fn build(&self, job: &Job) -> Result<EmailMessage, ValidationError>;
}

/// Dispatch table from job type to handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `send_email` and `send_digest` handlers.
    pub fn with_builtin(default_from: impl Into<String>) -> Self {
        let default_from = default_from.into();
        let mut registry = Self::new();
        registry.register(Arc::new(SendEmailHandler::new(default_from.clone())));
        registry.register(Arc::new(SendDigestHandler::new(default_from)));
        registry
    }

    /// Adds or replaces the handler for its job type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    /// Handler for `job_type`.
    ///
    /// # Errors
    ///
    /// [`ValidationError::UnsupportedJobType`] when nothing is registered.
    pub fn resolve(&self, job_type: &JobType) -> Result<&Arc<dyn JobHandler>, ValidationError> {
        self.handlers
            .get(job_type)
            .ok_or_else(|| ValidationError::UnsupportedJobType(job_type.to_string()))
    }

    /// Registered job types.
    pub fn job_types(&self) -> impl Iterator<Item = &JobType> {
        self.handlers.keys()
    }
}

/// A single address or a list of them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "OneOrMany")]
struct Addresses(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Addresses {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(address) => Self(vec![address]),
            OneOrMany::Many(addresses) => Self(addresses),
        }
    }
}

fn parse_payload<T: DeserializeOwned>(job: &Job) -> Result<T, ValidationError> {
    if !job.payload.is_object() {
        return Err(ValidationError::invalid_payload(&job.job_type, "payload must be an object"));
    }
    serde_json::from_value(job.payload.clone())
        .map_err(|e| ValidationError::invalid_payload(&job.job_type, e.to_string()))
}

/// Runs message validation, reporting schema failures under the job's type.
fn validated(job: &Job, message: EmailMessage) -> Result<EmailMessage, ValidationError> {
    message.validate().map_err(|err| match err {
        ValidationError::InvalidPayload { message, .. } => {
            ValidationError::invalid_payload(&job.job_type, message)
        },
        other => other,
    })?;
    Ok(message)
}

#[derive(Debug, Deserialize)]
struct SendEmailPayload {
    to: Addresses,
    #[serde(default)]
    cc: Addresses,
    #[serde(default)]
    bcc: Addresses,
    from: Option<String>,
    reply_to: Option<String>,
    subject: String,
    text: Option<String>,
    html: Option<String>,
}

/// Handler for `send_email`: the payload is the message.
#[derive(Debug, Clone)]
pub struct SendEmailHandler {
    default_from: String,
}

impl SendEmailHandler {
    /// Uses `default_from` when the payload has no sender.
    pub fn new(default_from: impl Into<String>) -> Self {
        Self { default_from: default_from.into() }
    }
}

impl JobHandler for SendEmailHandler {
    fn job_type(&self) -> JobType {
        JobType::SendEmail
    }

    fn build(&self, job: &Job) -> Result<EmailMessage, ValidationError> {
        let payload: SendEmailPayload = parse_payload(job)?;

        let from = payload.from.unwrap_or_else(|| self.default_from.clone());
        let message = EmailMessage {
            to: payload.to.0,
            cc: payload.cc.0,
            bcc: payload.bcc.0,
            reply_to: payload.reply_to,
            text: payload.text,
            html: payload.html,
            ..EmailMessage::new(from, payload.subject)
        };
        validated(job, message)
    }
}

#[derive(Debug, Deserialize)]
struct DigestItem {
    title: String,
    body: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendDigestPayload {
    to: Addresses,
    from: Option<String>,
    subject: Option<String>,
    items: Vec<DigestItem>,
}

/// Handler for `send_digest`: folds a list of items into one plain-text
/// email.
#[derive(Debug, Clone)]
pub struct SendDigestHandler {
    default_from: String,
}

impl SendDigestHandler {
    /// Uses `default_from` when the payload has no sender.
    pub fn new(default_from: impl Into<String>) -> Self {
        Self { default_from: default_from.into() }
    }

    fn compose(items: &[DigestItem]) -> String {
        let mut body = String::new();
        for (index, item) in items.iter().enumerate() {
            if index > 0 {
                body.push('\n');
            }
            let _ = writeln!(body, "{}. {}", index + 1, item.title.trim());
            if let Some(text) = item.body.as_deref().filter(|text| !text.trim().is_empty()) {
                let _ = writeln!(body, "   {}", text.trim());
            }
            if let Some(url) = item.url.as_deref().filter(|url| !url.trim().is_empty()) {
                let _ = writeln!(body, "   {}", url.trim());
            }
        }
        body
    }
}

impl JobHandler for SendDigestHandler {
    fn job_type(&self) -> JobType {
        JobType::SendDigest
    }

    fn build(&self, job: &Job) -> Result<EmailMessage, ValidationError> {
        let payload: SendDigestPayload = parse_payload(job)?;

        if payload.items.is_empty() {
            return Err(ValidationError::invalid_payload(&job.job_type, "items must not be empty"));
        }
        if payload.items.iter().any(|item| item.title.trim().is_empty()) {
            return Err(ValidationError::invalid_payload(&job.job_type, "item title is empty"));
        }

        let subject = payload
            .subject
            .unwrap_or_else(|| format!("Your digest: {} new items", payload.items.len()));
        let from = payload.from.unwrap_or_else(|| self.default_from.clone());
        let message = EmailMessage {
            to: payload.to.0,
            text: Some(Self::compose(&payload.items)),
            ..EmailMessage::new(from, subject)
        };
        validated(job, message)
    }
}
