//! SendGrid v3 mail-send adapter.
//!
//! A 202 means SendGrid queued the message. 429 carries a `Retry-After`
//! hint that is passed through to the retry policy. 401 and 403 mean a bad or
//! under-scoped API key.

use std::time::Duration;

use async_trait::async_trait;
use missive_core::DeliveryOutcome;
use reqwest::{header::HeaderMap, StatusCode};
use serde::Serialize;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    message::parse_mailbox,
    provider::SendGridConfig,
    EmailDispatcher, EmailMessage,
};

/// Used when a 429 arrives without a readable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Longest error body kept in a failure reason.
const MAX_REASON_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct Address {
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct Personalization {
    to: Vec<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cc: Vec<Address>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bcc: Vec<Address>,
}

#[derive(Debug, Serialize)]
struct ContentPart {
    #[serde(rename = "type")]
    mime_type: &'static str,
    value: String,
}

#[derive(Debug, Serialize)]
struct SendRequest {
    personalizations: Vec<Personalization>,
    from: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<Address>,
    subject: String,
    content: Vec<ContentPart>,
}

fn address(raw: &str) -> Result<Address> {
    let mailbox =
        parse_mailbox(raw).map_err(|e| DeliveryError::invalid_recipient(e.to_string()))?;
    Ok(Address { email: mailbox.email.to_string(), name: mailbox.name })
}

fn addresses(raw: &[String]) -> Result<Vec<Address>> {
    raw.iter().map(|a| address(a)).collect()
}

impl SendRequest {
    fn from_message(message: &EmailMessage) -> Result<Self> {
        let mut content = Vec::new();
        if let Some(text) = &message.text {
            content.push(ContentPart { mime_type: "text/plain", value: text.clone() });
        }
        if let Some(html) = &message.html {
            content.push(ContentPart { mime_type: "text/html", value: html.clone() });
        }
        if content.is_empty() {
            return Err(DeliveryError::invalid_message("message has no body"));
        }

        Ok(Self {
            personalizations: vec![Personalization {
                to: addresses(&message.to)?,
                cc: addresses(&message.cc)?,
                bcc: addresses(&message.bcc)?,
            }],
            from: address(&message.from)?,
            reply_to: message.reply_to.as_deref().map(address).transpose()?,
            subject: message.subject.clone(),
            content,
        })
    }
}

/// Adapter for the SendGrid HTTP API.
#[derive(Debug, Clone)]
pub struct SendGridDispatcher {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl SendGridDispatcher {
    /// Builds the HTTP client.
    pub fn new(config: &SendGridConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(DeliveryError::configuration("sendgrid api key is empty"));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("missive/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            endpoint: format!("{}/v3/mail/send", config.api_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            timeout: config.timeout,
        })
    }

    async fn deliver(&self, message: &EmailMessage) -> Result<()> {
        let request = SendRequest::from_message(message)?;

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::timeout(self.timeout)
                } else if e.is_connect() {
                    DeliveryError::network(format!("connection failed: {e}"))
                } else {
                    DeliveryError::network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "sendgrid accepted message");
            return Ok(());
        }

        let retry_after = extract_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, truncate(&body)))
    }
}

#[async_trait]
impl EmailDispatcher for SendGridDispatcher {
    async fn send(&self, message: &EmailMessage) -> DeliveryOutcome {
        let span = info_span!("sendgrid_send", recipients = message.to.len());
        async {
            match self.deliver(message).await {
                Ok(()) => DeliveryOutcome::Success,
                Err(err) => {
                    warn!(error = %err, category = %err.category(), "sendgrid send failed");
                    err.into()
                },
            }
        }
        .instrument(span)
        .await
    }

    fn provider_name(&self) -> &'static str {
        "sendgrid"
    }
}

fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: String,
) -> DeliveryError {
    match status.as_u16() {
        429 => DeliveryError::rate_limited(Some(retry_after.unwrap_or(DEFAULT_RETRY_AFTER))),
        401 | 403 => DeliveryError::authentication(body),
        code @ 500..=599 => DeliveryError::server(code, body),
        code => DeliveryError::rejected(code, body),
    }
}

fn truncate(body: &str) -> String {
    if body.len() <= MAX_REASON_BODY {
        return body.to_string();
    }
    let mut end = MAX_REASON_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &body[..end])
}

/// Reads `Retry-After` as seconds or an HTTP date.
fn extract_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    at.with_timezone(&chrono::Utc).signed_duration_since(chrono::Utc::now()).to_std().ok()
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn config(server: &MockServer) -> SendGridConfig {
        SendGridConfig {
            api_key: "SG.test".into(),
            api_url: server.uri(),
            timeout: Duration::from_secs(5),
        }
    }

    fn message() -> EmailMessage {
        EmailMessage::new("Office <office@school.example>", "Timetable")
            .to("parent@example.com")
            .cc("Registrar <registrar@school.example>")
            .text("New timetable attached")
    }

    async fn send_with(response: ResponseTemplate) -> DeliveryOutcome {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v3/mail/send"))
            .respond_with(response)
            .mount(&server)
            .await;

        SendGridDispatcher::new(&config(&server)).unwrap().send(&message()).await
    }

    #[tokio::test]
    async fn accepted_is_success() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v3/mail/send"))
            .and(matchers::header("authorization", "Bearer SG.test"))
            .and(matchers::body_partial_json(serde_json::json!({
                "personalizations": [{
                    "to": [{ "email": "parent@example.com" }],
                    "cc": [{ "email": "registrar@school.example", "name": "Registrar" }]
                }],
                "from": { "email": "office@school.example", "name": "Office" },
                "subject": "Timetable",
                "content": [{ "type": "text/plain", "value": "New timetable attached" }]
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = SendGridDispatcher::new(&config(&server)).unwrap().send(&message()).await;

        assert_eq!(outcome, DeliveryOutcome::Success);
    }

    #[tokio::test]
    async fn rate_limit_is_transient_with_hint() {
        let outcome =
            send_with(ResponseTemplate::new(429).append_header("Retry-After", "120")).await;

        match outcome {
            DeliveryOutcome::TransientFailure { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(120)));
            },
            other => panic!("expected transient failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_without_header_uses_default_wait() {
        let outcome = send_with(ResponseTemplate::new(429)).await;

        match outcome {
            DeliveryOutcome::TransientFailure { retry_after, .. } => {
                assert_eq!(retry_after, Some(DEFAULT_RETRY_AFTER));
            },
            other => panic!("expected transient failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let outcome = send_with(ResponseTemplate::new(503).set_body_string("busy")).await;
        assert!(matches!(outcome, DeliveryOutcome::TransientFailure { .. }));
    }

    #[tokio::test]
    async fn bad_key_is_permanent() {
        let outcome = send_with(ResponseTemplate::new(401).set_body_string("bad key")).await;
        assert!(matches!(outcome, DeliveryOutcome::PermanentFailure { .. }));
    }

    #[tokio::test]
    async fn bad_request_is_permanent() {
        let body = r#"{"errors":[{"message":"Does not contain a valid address."}]}"#;
        let outcome = send_with(ResponseTemplate::new(400).set_body_string(body)).await;

        match outcome {
            DeliveryOutcome::PermanentFailure { reason } => {
                assert!(reason.contains("valid address"));
            },
            other => panic!("expected permanent failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_provider_times_out_as_transient() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(202).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;
        let config = SendGridConfig { timeout: Duration::from_millis(200), ..config(&server) };

        let outcome = SendGridDispatcher::new(&config).unwrap().send(&message()).await;

        assert!(matches!(outcome, DeliveryOutcome::TransientFailure { .. }));
    }

    #[tokio::test]
    async fn unbuildable_message_never_reaches_provider() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(202))
            .expect(0)
            .mount(&server)
            .await;

        let mut msg = message();
        msg.text = None;
        let outcome = SendGridDispatcher::new(&config(&server)).unwrap().send(&msg).await;

        assert!(matches!(outcome, DeliveryOutcome::PermanentFailure { .. }));
    }

    #[test]
    fn empty_api_key_rejected() {
        let config = SendGridConfig {
            api_key: " ".into(),
            api_url: "https://api.sendgrid.com".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(SendGridDispatcher::new(&config).is_err());
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(MAX_REASON_BODY);
        let reason = truncate(&body);
        assert!(reason.ends_with("... (truncated)"));
        assert!(reason.len() < body.len());
    }
}
