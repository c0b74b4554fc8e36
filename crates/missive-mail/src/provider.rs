//! Provider selection.
//!
//! The worker config resolves to one [`ProviderConfig`] at startup and
//! [`build_dispatcher`] turns it into the process-wide dispatcher. Nothing
//! downstream branches on the provider again.

use std::{sync::Arc, time::Duration};

use tracing::info;

use crate::{
    error::Result, sendgrid::SendGridDispatcher, ses::SesDispatcher, smtp::SmtpDispatcher,
    EmailDispatcher, SmtpConfig,
};

/// SES settings. Credentials come from the standard AWS provider chain.
#[derive(Debug, Clone)]
pub struct SesConfig {
    /// Region override; the SDK default chain applies when unset.
    pub region: Option<String>,
    /// Configuration set attached to every send.
    pub configuration_set: Option<String>,
    /// Limit on a whole `SendEmail` call, retries inside the SDK included.
    pub timeout: Duration,
}

impl Default for SesConfig {
    fn default() -> Self {
        Self { region: None, configuration_set: None, timeout: Duration::from_secs(30) }
    }
}

/// SendGrid settings.
#[derive(Debug, Clone)]
pub struct SendGridConfig {
    /// API key with mail-send scope.
    pub api_key: String,
    /// API base URL.
    pub api_url: String,
    /// Request timeout.
    pub timeout: Duration,
}

/// The one provider this process delivers through.
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    /// Amazon SES.
    Ses(SesConfig),
    /// SendGrid.
    SendGrid(SendGridConfig),
    /// SMTP relay.
    Smtp(SmtpConfig),
}

impl ProviderConfig {
    /// Provider name as configured.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ses(_) => "ses",
            Self::SendGrid(_) => "sendgrid",
            Self::Smtp(_) => "smtp",
        }
    }
}

/// Builds the dispatcher for `config`.
///
/// # Errors
///
/// Returns a configuration error when the adapter cannot be constructed,
/// for example an empty API key or an unresolvable relay host.
pub async fn build_dispatcher(config: &ProviderConfig) -> Result<Arc<dyn EmailDispatcher>> {
    let dispatcher: Arc<dyn EmailDispatcher> = match config {
        ProviderConfig::Ses(ses) => {
            let mut loader = aws_config::from_env();
            if let Some(region) = &ses.region {
                loader = loader.region(aws_config::Region::new(region.clone()));
            }
            let sdk_config = loader.load().await;
            Arc::new(SesDispatcher::new(&sdk_config, ses))
        },
        ProviderConfig::SendGrid(sendgrid) => Arc::new(SendGridDispatcher::new(sendgrid)?),
        ProviderConfig::Smtp(smtp) => Arc::new(SmtpDispatcher::new(smtp)?),
    };

    info!(provider = dispatcher.provider_name(), "email dispatcher ready");
    Ok(dispatcher)
}
