//! Email delivery through interchangeable providers.
//!
//! Every provider sits behind the [`EmailDispatcher`] capability trait and
//! reports a provider-neutral [`DeliveryOutcome`]. Exactly one adapter is
//! active per process, chosen at startup by [`build_dispatcher`]:
//!
//! - [`ses::SesDispatcher`]: Amazon SES v2 `SendEmail`
//! - [`sendgrid::SendGridDispatcher`]: SendGrid v3 mail send over HTTPS
//! - [`smtp::SmtpDispatcher`]: any SMTP relay
//!
//! Adapters share one failure taxonomy, [`DeliveryError`], so credential,
//! configuration and address problems are permanent everywhere while
//! timeouts, resets, throttling and provider-side errors are transient.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use missive_core::DeliveryOutcome;

pub mod error;
pub mod message;
pub mod mock;
pub mod provider;
pub mod sendgrid;
pub mod ses;
pub mod smtp;

pub use error::{DeliveryError, ErrorCategory};
pub use message::{parse_mailbox, EmailMessage};
pub use mock::ScriptedDispatcher;
pub use provider::{build_dispatcher, ProviderConfig, SendGridConfig, SesConfig};
pub use smtp::{SmtpConfig, SmtpTls};

/// Sends one email through the active provider.
///
/// Implementations never return provider error types; every failure is
/// folded into [`DeliveryOutcome::TransientFailure`] or
/// [`DeliveryOutcome::PermanentFailure`].
#[async_trait]
pub trait EmailDispatcher: Send + Sync + std::fmt::Debug {
    /// Attempts delivery of `message`.
    async fn send(&self, message: &EmailMessage) -> DeliveryOutcome;

    /// Provider name for logs.
    fn provider_name(&self) -> &'static str;
}
