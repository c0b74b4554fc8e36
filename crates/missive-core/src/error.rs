//! Validation failures for jobs pulled off a queue.
//!
//! Every variant is permanent: a malformed job never becomes valid by being
//! retried, so callers dead-letter on any of these without spending retry
//! budget.

use thiserror::Error;

use crate::JobType;

/// Reasons a dequeued job cannot be processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The message body is not a decodable job envelope.
    #[error("malformed job envelope: {0}")]
    MalformedEnvelope(String),

    /// No handler is registered for the job's type.
    #[error("no handler registered for job type '{0}'")]
    UnsupportedJobType(String),

    /// The payload does not match the schema of its job type.
    #[error("invalid {job_type} payload: {message}")]
    InvalidPayload {
        /// Job type whose schema was violated
        job_type: String,
        /// What was wrong with the payload
        message: String,
    },

    /// An address field could not be parsed as a mailbox.
    #[error("invalid email address '{address}': {message}")]
    InvalidAddress {
        /// The offending address as it appeared in the payload
        address: String,
        /// Parser message
        message: String,
    },
}

impl ValidationError {
    /// Creates an invalid payload error for the given job type.
    pub fn invalid_payload(job_type: &JobType, message: impl Into<String>) -> Self {
        Self::InvalidPayload { job_type: job_type.as_str().to_string(), message: message.into() }
    }

    /// Creates an invalid address error.
    pub fn invalid_address(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAddress { address: address.into(), message: message.into() }
    }
}
