//! Amazon SES v2 adapter.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sesv2::{
    config::timeout::TimeoutConfig,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    operation::send_email::SendEmailError,
    types::{Body, Content, Destination, EmailContent, Message},
    Client,
};
use missive_core::DeliveryOutcome;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    provider::SesConfig,
    EmailDispatcher, EmailMessage,
};

const CHARSET: &str = "UTF-8";

/// Adapter for Amazon SES.
#[derive(Debug, Clone)]
pub struct SesDispatcher {
    client: Client,
    configuration_set: Option<String>,
    timeout: Duration,
}

impl SesDispatcher {
    /// Creates an adapter from a loaded AWS SDK config.
    pub fn new(sdk_config: &SdkConfig, config: &SesConfig) -> Self {
        let ses_config = aws_sdk_sesv2::config::Builder::from(sdk_config)
            .timeout_config(TimeoutConfig::builder().operation_timeout(config.timeout).build())
            .build();
        Self {
            client: Client::from_conf(ses_config),
            configuration_set: config.configuration_set.clone(),
            timeout: config.timeout,
        }
    }

    fn content(message: &EmailMessage) -> Result<EmailContent> {
        let text = |data: &str| {
            Content::builder()
                .data(data)
                .charset(CHARSET)
                .build()
                .map_err(|e| DeliveryError::invalid_message(e.to_string()))
        };

        let mut body = Body::builder();
        if let Some(plain) = &message.text {
            body = body.text(text(plain)?);
        }
        if let Some(html) = &message.html {
            body = body.html(text(html)?);
        }

        let simple = Message::builder().subject(text(&message.subject)?).body(body.build()).build();
        Ok(EmailContent::builder().simple(simple).build())
    }

    async fn deliver(&self, message: &EmailMessage) -> Result<Option<String>> {
        let destination = Destination::builder()
            .set_to_addresses(Some(message.to.clone()))
            .set_cc_addresses(Some(message.cc.clone()).filter(|cc| !cc.is_empty()))
            .set_bcc_addresses(Some(message.bcc.clone()).filter(|bcc| !bcc.is_empty()))
            .build();

        let output = self
            .client
            .send_email()
            .from_email_address(&message.from)
            .destination(destination)
            .set_reply_to_addresses(message.reply_to.clone().map(|reply_to| vec![reply_to]))
            .content(Self::content(message)?)
            .set_configuration_set_name(self.configuration_set.clone())
            .send()
            .await
            .map_err(|err| classify(err, self.timeout))?;

        Ok(output.message_id().map(str::to_string))
    }
}

#[async_trait]
impl EmailDispatcher for SesDispatcher {
    async fn send(&self, message: &EmailMessage) -> DeliveryOutcome {
        let span = info_span!("ses_send", recipients = message.to.len());
        async {
            match self.deliver(message).await {
                Ok(message_id) => {
                    debug!(message_id = ?message_id, "ses accepted message");
                    DeliveryOutcome::Success
                },
                Err(err) => {
                    warn!(error = %err, category = %err.category(), "ses send failed");
                    err.into()
                },
            }
        }
        .instrument(span)
        .await
    }

    fn provider_name(&self) -> &'static str {
        "ses"
    }
}

fn classify(err: SdkError<SendEmailError>, timeout: Duration) -> DeliveryError {
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) => DeliveryError::timeout(timeout),
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            DeliveryError::network(message)
        },
        SdkError::ConstructionFailure(_) => DeliveryError::configuration(message),
        SdkError::ServiceError(context) => {
            classify_service_error(err.code(), context.raw().status().as_u16(), message)
        },
        _ => DeliveryError::network(message),
    }
}

/// Maps an SES error code and HTTP status onto the shared taxonomy.
pub(crate) fn classify_service_error(
    code: Option<&str>,
    status: u16,
    message: String,
) -> DeliveryError {
    match code {
        Some("TooManyRequestsException" | "ThrottlingException" | "LimitExceededException") => {
            DeliveryError::rate_limited(None)
        },
        Some(
            "UnrecognizedClientException"
            | "InvalidClientTokenId"
            | "SignatureDoesNotMatch"
            | "AccessDeniedException"
            | "ExpiredTokenException",
        ) => DeliveryError::authentication(message),
        Some(
            "MailFromDomainNotVerifiedException"
            | "AccountSuspendedException"
            | "SendingPausedException"
            | "NotFoundException",
        ) => DeliveryError::configuration(message),
        Some("MessageRejected") => DeliveryError::invalid_recipient(message),
        Some("BadRequestException") => DeliveryError::rejected(status, message),
        _ if status >= 500 => DeliveryError::server(status, message),
        _ if status == 429 => DeliveryError::rate_limited(None),
        _ if (400..500).contains(&status) => DeliveryError::rejected(status, message),
        _ => DeliveryError::server(status, message),
    }
}
