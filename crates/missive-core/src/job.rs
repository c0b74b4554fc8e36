//! Job model and the wire envelope producers publish.
//!
//! A producer enqueues a [`JobEnvelope`] serialized as JSON. A queue backend
//! turns each received message into a [`Job`], which pairs the envelope with
//! the [`ReceiptHandle`] needed to acknowledge it and the [`QueueKind`] it
//! was read from. Priority is never part of the envelope; it is a property of
//! the queue.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a logical task, stable across redeliveries and requeues.
///
/// Handlers dedupe on this value, so producers must reuse it when they
/// resubmit the same notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Wraps an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of work a job describes; selects the handler it is routed to.
///
/// Unrecognised names survive decoding as [`JobType::Unknown`] so the job
/// can be dead-lettered with its original type visible in the record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    /// Send a single email.
    SendEmail,
    /// Compose a list of items into one digest email.
    SendDigest,
    /// Any type this worker has no built-in name for.
    Unknown(String),
}

impl JobType {
    /// Canonical wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::SendEmail => "send_email",
            Self::SendDigest => "send_digest",
            Self::Unknown(name) => name,
        }
    }
}

impl FromStr for JobType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl From<String> for JobType {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "send_email" => Self::SendEmail,
            "send_digest" => Self::SendDigest,
            _ => Self::Unknown(s),
        }
    }
}

impl From<JobType> for String {
    fn from(job_type: JobType) -> Self {
        job_type.as_str().to_string()
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two logical queues a message was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Drained preferentially on every cycle.
    Priority,
    /// Polled only when the priority queue is empty or has had its turn.
    Regular,
}

impl QueueKind {
    /// Both queues in polling order.
    pub const ALL: [QueueKind; 2] = [QueueKind::Priority, QueueKind::Regular];

    /// Lowercase name used in logs and storage keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::Regular => "regular",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend token that proves a consumer currently holds a message.
///
/// Valid until acked, requeued or until the visibility timeout elapses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle {
    queue: QueueKind,
    token: String,
}

impl ReceiptHandle {
    /// Creates a receipt for a message held from `queue`.
    pub fn new(queue: QueueKind, token: impl Into<String>) -> Self {
        Self { queue, token: token.into() }
    }

    /// Queue the receipt belongs to.
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Opaque backend token.
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// JSON body of a queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Logical task identifier.
    pub id: JobId,
    /// Routing key.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Failed retryable attempts so far.
    #[serde(default)]
    pub attempt: u32,
    /// Handler-specific data.
    #[serde(default)]
    pub payload: Value,
}

impl JobEnvelope {
    /// Creates a first-attempt envelope.
    pub fn new(id: impl Into<JobId>, job_type: JobType, payload: Value) -> Self {
        Self { id: id.into(), job_type, attempt: 0, payload }
    }

    /// Serializes the envelope to its wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A message held by this worker, decoded from its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Logical task identifier.
    pub id: JobId,
    /// Routing key.
    pub job_type: JobType,
    /// Handler-specific data.
    pub payload: Value,
    /// Failed retryable attempts so far.
    pub attempt: u32,
    /// Receipt for the message this job was decoded from.
    pub receipt: ReceiptHandle,
    /// When the worker received the message.
    pub received_at: DateTime<Utc>,
    /// Set when the body was not a valid envelope.
    pub decode_error: Option<String>,
}

impl Job {
    /// Builds a job from an already decoded envelope.
    pub fn from_envelope(
        envelope: JobEnvelope,
        receipt: ReceiptHandle,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: envelope.id,
            job_type: envelope.job_type,
            payload: envelope.payload,
            attempt: envelope.attempt,
            receipt,
            received_at,
            decode_error: None,
        }
    }

    /// Decodes a raw message body.
    ///
    /// Never fails: a body that is not an envelope yields a job carrying the
    /// backend's `message_id`, an empty unknown type, the raw body as a
    /// string payload and the parse error in `decode_error`.
    pub fn decode(
        body: &str,
        message_id: &str,
        receipt: ReceiptHandle,
        received_at: DateTime<Utc>,
    ) -> Self {
        match serde_json::from_str::<JobEnvelope>(body) {
            Ok(envelope) => Self::from_envelope(envelope, receipt, received_at),
            Err(err) => Self {
                id: JobId::new(message_id),
                job_type: JobType::Unknown(String::new()),
                payload: Value::String(body.to_string()),
                attempt: 0,
                receipt,
                received_at,
                decode_error: Some(err.to_string()),
            },
        }
    }

    /// Queue the job was read from.
    pub fn priority(&self) -> QueueKind {
        self.receipt.queue()
    }

    /// Envelope for publishing this job again with a new attempt count.
    pub fn envelope_for_attempt(&self, attempt: u32) -> JobEnvelope {
        JobEnvelope {
            id: self.id.clone(),
            job_type: self.job_type.clone(),
            attempt,
            payload: self.payload.clone(),
        }
    }
}
