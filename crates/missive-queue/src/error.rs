//! Queue backend failures.

use missive_core::QueueKind;
use thiserror::Error;

/// Result alias for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors a queue backend can report.
///
/// Poll errors abort a single cycle. [`QueueError::ReceiptExpired`] on ack
/// means the message may be redelivered; callers log it and move on.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Connection or transport failure.
    #[error("queue backend unreachable: {message}")]
    Unreachable {
        /// Transport error description
        message: String,
    },

    /// The receipt is no longer valid: acked already or visibility lapsed.
    #[error("receipt handle for {queue} queue expired or already consumed")]
    ReceiptExpired {
        /// Queue the receipt belonged to
        queue: QueueKind,
    },

    /// The backend rejected the request.
    #[error("queue backend error: {message}")]
    Backend {
        /// Backend error description
        message: String,
    },

    /// A job or record could not be encoded.
    #[error("queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend is not configured for the requested operation.
    #[error("queue configuration error: {message}")]
    Configuration {
        /// What is missing or wrong
        message: String,
    },
}

impl QueueError {
    /// Creates an unreachable error.
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable { message: message.into() }
    }

    /// Creates a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// True when the receipt lapsed and the message may be redelivered.
    pub fn is_receipt_expired(&self) -> bool {
        matches!(self, Self::ReceiptExpired { .. })
    }
}

impl From<::redis::RedisError> for QueueError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            Self::unreachable(err.to_string())
        } else {
            Self::backend(err.to_string())
        }
    }
}
