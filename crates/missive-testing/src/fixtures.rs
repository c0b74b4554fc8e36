//! Envelope builders and raw message bodies for tests.

use missive_core::{JobEnvelope, JobId, JobType};
use serde_json::{json, Value};
use uuid::Uuid;

/// Bodies that are not valid job envelopes.
pub mod malformed {
    /// Not JSON at all.
    pub const NOT_JSON: &str = "{this is not json";
    /// JSON without an `id`.
    pub const MISSING_ID: &str = r#"{"type":"send_email","payload":{}}"#;
    /// JSON without a `type`.
    pub const MISSING_TYPE: &str = r#"{"id":"job-1","payload":{}}"#;
    /// A bare string.
    pub const BARE_STRING: &str = r#""send_email""#;
}

/// Builder for `send_email` envelopes.
#[derive(Debug, Clone)]
pub struct EmailJobBuilder {
    id: JobId,
    attempt: u32,
    to: Vec<String>,
    from: Option<String>,
    subject: String,
    text: Option<String>,
    html: Option<String>,
}

impl EmailJobBuilder {
    /// A deliverable email with a random id.
    pub fn new() -> Self {
        Self {
            id: JobId::new(format!("job_{}", Uuid::new_v4().simple())),
            attempt: 0,
            to: vec!["parent@example.com".to_string()],
            from: None,
            subject: "School trip on Friday".to_string(),
            text: Some("Please pack a coat and lunch.".to_string()),
            html: None,
        }
    }

    /// Sets the job id.
    #[must_use]
    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the attempt count carried by the envelope.
    #[must_use]
    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Replaces the recipients.
    #[must_use]
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.to = vec![recipient.into()];
        self
    }

    /// Sets an explicit sender.
    #[must_use]
    pub fn from(mut self, sender: impl Into<String>) -> Self {
        self.from = Some(sender.into());
        self
    }

    /// Sets the subject.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets an HTML body alongside the text one.
    #[must_use]
    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Drops both bodies, which makes the payload invalid.
    #[must_use]
    pub fn without_body(mut self) -> Self {
        self.text = None;
        self.html = None;
        self
    }

    /// Builds the envelope.
    pub fn build(self) -> JobEnvelope {
        let mut payload = json!({ "to": self.to, "subject": self.subject });
        if let Value::Object(fields) = &mut payload {
            if let Some(from) = self.from {
                fields.insert("from".into(), Value::String(from));
            }
            if let Some(text) = self.text {
                fields.insert("text".into(), Value::String(text));
            }
            if let Some(html) = self.html {
                fields.insert("html".into(), Value::String(html));
            }
        }

        JobEnvelope { id: self.id, job_type: JobType::SendEmail, attempt: self.attempt, payload }
    }
}

impl Default for EmailJobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a `send_digest` envelope with `count` items.
pub fn digest_job(id: impl Into<JobId>, count: usize) -> JobEnvelope {
    let items: Vec<Value> = (1..=count)
        .map(|n| {
            json!({
                "title": format!("Notice {n}"),
                "body": format!("Details for notice {n}."),
                "url": format!("https://school.example/notices/{n}"),
            })
        })
        .collect();

    JobEnvelope::new(id, JobType::SendDigest, json!({ "to": "parent@example.com", "items": items }))
}

/// `count` deliverable email envelopes with ids `{prefix}-0`, `{prefix}-1`, ...
pub fn email_jobs(prefix: &str, count: usize) -> Vec<JobEnvelope> {
    (0..count).map(|n| EmailJobBuilder::new().id(format!("{prefix}-{n}")).build()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_builder_defaults_are_deliverable() {
        let envelope = EmailJobBuilder::new().id("job-1").build();

        assert_eq!(envelope.id.as_str(), "job-1");
        assert_eq!(envelope.job_type, JobType::SendEmail);
        assert_eq!(envelope.payload["to"][0], "parent@example.com");
        assert!(envelope.payload.get("text").is_some());
        assert!(envelope.payload.get("from").is_none());
    }

    #[test]
    fn without_body_removes_text_and_html() {
        let envelope = EmailJobBuilder::new().html("<p>hi</p>").without_body().build();

        assert!(envelope.payload.get("text").is_none());
        assert!(envelope.payload.get("html").is_none());
    }

    #[test]
    fn digest_items_are_numbered() {
        let envelope = digest_job("digest-1", 3);

        assert_eq!(envelope.payload["items"].as_array().map(Vec::len), Some(3));
        assert_eq!(envelope.payload["items"][2]["title"], "Notice 3");
    }
}
