//! Provider-neutral result of a delivery attempt.

use std::{fmt, time::Duration};

/// What happened when a mail adapter tried to deliver a message.
///
/// Adapters fold their provider-specific errors into one of the two failure
/// classes. Transient failures may succeed later; permanent ones never will.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The provider accepted the message.
    Success,
    /// Worth retrying: timeouts, connection resets, throttling, provider 5xx.
    TransientFailure {
        /// Human-readable cause
        reason: String,
        /// Minimum wait the provider asked for, if any
        retry_after: Option<Duration>,
    },
    /// Never worth retrying: bad credentials, bad configuration, bad recipient.
    PermanentFailure {
        /// Human-readable cause
        reason: String,
    },
}

impl DeliveryOutcome {
    /// Transient failure without a provider wait hint.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientFailure { reason: reason.into(), retry_after: None }
    }

    /// Permanent failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure { reason: reason.into() }
    }

    /// Returns true for [`DeliveryOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Failure reason, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::TransientFailure { reason, .. } | Self::PermanentFailure { reason } => {
                Some(reason)
            },
        }
    }

    /// Short label for structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransientFailure { .. } => "transient_failure",
            Self::PermanentFailure { .. } => "permanent_failure",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {}", self.label(), reason),
            None => f.write_str(self.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_reason() {
        assert_eq!(DeliveryOutcome::Success.to_string(), "success");
        assert_eq!(
            DeliveryOutcome::permanent("mailbox does not exist").to_string(),
            "permanent_failure: mailbox does not exist"
        );
        assert_eq!(DeliveryOutcome::transient("throttled").reason(), Some("throttled"));
    }
}
