//! Provider failure taxonomy shared by every mail adapter.
//!
//! Adapters translate their SDK or transport errors into a [`DeliveryError`]
//! and then into a [`DeliveryOutcome`]. The split into transient and
//! permanent lives here once, so all providers classify the same way.

use std::{fmt, time::Duration};

use missive_core::DeliveryOutcome;
use thiserror::Error;

/// Result type alias for adapter internals.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failures a mail provider call can end in.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection refused, reset or dropped.
    #[error("network failure: {message}")]
    Network {
        /// Transport error description
        message: String,
    },

    /// The provider did not answer in time.
    #[error("provider timed out after {timeout_seconds}s")]
    Timeout {
        /// Client-side timeout that elapsed
        timeout_seconds: u64,
    },

    /// The provider throttled the request.
    #[error("rate limited by provider")]
    RateLimited {
        /// Wait the provider asked for, if it said
        retry_after: Option<Duration>,
    },

    /// Provider-side failure (HTTP 5xx, SMTP 4xx).
    #[error("provider error {code}: {message}")]
    Server {
        /// Status or reply code
        code: u16,
        /// Provider message
        message: String,
    },

    /// Credentials rejected.
    #[error("authentication failed: {message}")]
    Authentication {
        /// Provider message
        message: String,
    },

    /// A recipient or sender address was refused.
    #[error("invalid recipient: {message}")]
    InvalidRecipient {
        /// Provider message
        message: String,
    },

    /// The provider rejected the request itself (HTTP 4xx, SMTP 5xx).
    #[error("request rejected {code}: {message}")]
    Rejected {
        /// Status or reply code
        code: u16,
        /// Provider message
        message: String,
    },

    /// The adapter is misconfigured.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is missing or wrong
        message: String,
    },

    /// The message could not be built for the provider.
    #[error("message build failed: {message}")]
    InvalidMessage {
        /// Builder error
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_seconds: timeout.as_secs() }
    }

    /// Creates a rate limit error.
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::RateLimited { retry_after }
    }

    /// Creates a provider-side error.
    pub fn server(code: u16, message: impl Into<String>) -> Self {
        Self::Server { code, message: message.into() }
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication { message: message.into() }
    }

    /// Creates an invalid recipient error.
    pub fn invalid_recipient(message: impl Into<String>) -> Self {
        Self::InvalidRecipient { message: message.into() }
    }

    /// Creates a rejected-request error.
    pub fn rejected(code: u16, message: impl Into<String>) -> Self {
        Self::Rejected { code, message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a message build error.
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage { message: message.into() }
    }

    /// True when the same request may succeed later.
    ///
    /// Timeouts, connection failures, throttling and provider-side errors
    /// are retryable. Credential, configuration and address problems never
    /// fix themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::Server { .. } => true,

            Self::Authentication { .. }
            | Self::InvalidRecipient { .. }
            | Self::Rejected { .. }
            | Self::Configuration { .. }
            | Self::InvalidMessage { .. } => false,
        }
    }

    /// Provider wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Broad category for logs.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<DeliveryError> for DeliveryOutcome {
    fn from(err: DeliveryError) -> Self {
        let retry_after = err.retry_after();
        if err.is_retryable() {
            DeliveryOutcome::TransientFailure { reason: err.to_string(), retry_after }
        } else {
            DeliveryOutcome::PermanentFailure { reason: err.to_string() }
        }
    }
}

/// Coarse grouping of delivery errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network, timeout.
    Transport,
    /// Throttling.
    RateLimit,
    /// Provider-side failure.
    Provider,
    /// Credentials or configuration.
    Setup,
    /// Bad address or unbuildable message.
    Content,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(err: &DeliveryError) -> Self {
        match err {
            DeliveryError::Network { .. } | DeliveryError::Timeout { .. } => Self::Transport,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::Server { .. } => Self::Provider,
            DeliveryError::Authentication { .. } | DeliveryError::Configuration { .. } => {
                Self::Setup
            },
            DeliveryError::InvalidRecipient { .. }
            | DeliveryError::Rejected { .. }
            | DeliveryError::InvalidMessage { .. } => Self::Content,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::RateLimit => "rate_limit",
            Self::Provider => "provider",
            Self::Setup => "setup",
            Self::Content => "content",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes_are_retryable() {
        assert!(DeliveryError::network("connection reset by peer").is_retryable());
        assert!(DeliveryError::timeout(Duration::from_secs(30)).is_retryable());
        assert!(DeliveryError::rate_limited(None).is_retryable());
        assert!(DeliveryError::server(503, "unavailable").is_retryable());
    }

    #[test]
    fn permanent_classes_are_not_retryable() {
        assert!(!DeliveryError::authentication("bad api key").is_retryable());
        assert!(!DeliveryError::configuration("sender not verified").is_retryable());
        assert!(!DeliveryError::invalid_recipient("no such mailbox").is_retryable());
        assert!(!DeliveryError::rejected(400, "bad request").is_retryable());
        assert!(!DeliveryError::invalid_message("no body").is_retryable());
    }

    #[test]
    fn conversion_keeps_retry_hint() {
        let outcome: DeliveryOutcome =
            DeliveryError::rate_limited(Some(Duration::from_secs(42))).into();

        assert_eq!(
            outcome,
            DeliveryOutcome::TransientFailure {
                reason: "rate limited by provider".into(),
                retry_after: Some(Duration::from_secs(42)),
            }
        );
    }

    #[test]
    fn conversion_marks_permanent() {
        let outcome: DeliveryOutcome = DeliveryError::authentication("invalid key").into();
        assert!(matches!(outcome, DeliveryOutcome::PermanentFailure { .. }));
    }

    #[test]
    fn categories_display() {
        let timeout = DeliveryError::timeout(Duration::from_secs(1));
        assert_eq!(timeout.category().to_string(), "transport");
        assert_eq!(DeliveryError::authentication("x").category(), ErrorCategory::Setup);
        assert_eq!(DeliveryError::invalid_recipient("x").category(), ErrorCategory::Content);
    }
}
