//! Amazon SQS backend.
//!
//! Priority and regular jobs live in two separate queues. Requeue is
//! implemented as send-with-delay followed by delete, so the retried copy
//! carries its new attempt count in the body and the original's receive count
//! does not trip any redrive policy configured on the queue.
//!
//! A receive with a zero wait samples only a subset of the SQS servers and
//! can come back empty while messages exist. The worker therefore polls the
//! priority queue with a short non-zero wait on this backend (see
//! `PRIORITY_WAIT_TIME_SECONDS`), trading up to a second of latency on the
//! regular queue for not skipping priority work.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sqs::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    Client,
};
use missive_core::{Clock, Job, QueueKind, ReceiptHandle, RealClock};
use tracing::{debug, error, warn};

use crate::{
    DeadLetterRecord, QueueClient, QueueError, Result, DEFAULT_VISIBILITY_TIMEOUT, MAX_BATCH_SIZE,
    MAX_DELAY, MAX_WAIT_TIME,
};

/// Error codes SQS returns for receipts that are no longer valid.
const EXPIRED_RECEIPT_CODES: [&str; 3] = [
    "ReceiptHandleIsInvalid",
    "InvalidParameterValue",
    "AWS.SimpleQueueService.MessageNotInflight",
];

/// Queue URLs and receive settings.
#[derive(Debug, Clone)]
pub struct SqsQueueConfig {
    /// URL of the priority queue.
    pub priority_url: String,
    /// URL of the regular queue.
    pub regular_url: String,
    /// Where dead-letter records are sent; logged only when unset.
    pub dead_letter_url: Option<String>,
    /// Visibility timeout requested on every receive.
    pub visibility_timeout: Duration,
}

impl SqsQueueConfig {
    /// Config for two queues with no dead-letter queue.
    pub fn new(priority_url: impl Into<String>, regular_url: impl Into<String>) -> Self {
        Self {
            priority_url: priority_url.into(),
            regular_url: regular_url.into(),
            dead_letter_url: None,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

/// Queue backend over two SQS queues.
#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: Client,
    config: SqsQueueConfig,
    clock: Arc<dyn Clock>,
}

impl SqsQueue {
    /// Creates a backend from a loaded AWS SDK config.
    pub fn new(sdk_config: &SdkConfig, config: SqsQueueConfig) -> Self {
        let sqs_config = aws_sdk_sqs::config::Builder::from(sdk_config).build();
        Self::with_client(Client::from_conf(sqs_config), config)
    }

    /// Creates a backend around an existing client.
    pub fn with_client(client: Client, config: SqsQueueConfig) -> Self {
        Self { client, config, clock: Arc::new(RealClock::new()) }
    }

    fn url(&self, queue: QueueKind) -> &str {
        match queue {
            QueueKind::Priority => &self.config.priority_url,
            QueueKind::Regular => &self.config.regular_url,
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(self.url(receipt.queue()))
            .receipt_handle(receipt.token())
            .send()
            .await
            .map_err(|e| classify_receipt_error(e, receipt.queue()))?;
        Ok(())
    }
}

#[async_trait]
impl QueueClient for SqsQueue {
    async fn poll_batch(
        &self,
        queue: QueueKind,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Job>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let output = self
            .client
            .receive_message()
            .queue_url(self.url(queue))
            .max_number_of_messages(to_i32(max_messages.min(MAX_BATCH_SIZE)))
            .wait_time_seconds(to_i32(wait_time.min(MAX_WAIT_TIME).as_secs()))
            .visibility_timeout(to_i32(self.config.visibility_timeout.as_secs()))
            .send()
            .await
            .map_err(classify_error)?;

        let received_at = self.clock.now_utc();
        let mut jobs = Vec::new();
        for message in output.messages.unwrap_or_default() {
            let Some(token) = message.receipt_handle() else {
                warn!(
                    queue = %queue,
                    message_id = ?message.message_id(),
                    "message without receipt handle skipped"
                );
                continue;
            };
            let message_id = message.message_id().unwrap_or(token);
            let receipt = ReceiptHandle::new(queue, token);
            let body = message.body().unwrap_or_default();
            jobs.push(Job::decode(body, message_id, receipt, received_at));
        }

        debug!(queue = %queue, count = jobs.len(), "polled sqs queue");
        Ok(jobs)
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<()> {
        self.delete(receipt).await
    }

    async fn extend_visibility(&self, receipt: &ReceiptHandle, extra: Duration) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(self.url(receipt.queue()))
            .receipt_handle(receipt.token())
            .visibility_timeout(to_i32(extra.as_secs()))
            .send()
            .await
            .map_err(|e| classify_receipt_error(e, receipt.queue()))?;
        Ok(())
    }

    async fn requeue(&self, job: &Job, next_attempt: u32, delay: Duration) -> Result<()> {
        let body = job.envelope_for_attempt(next_attempt).to_json()?;
        if delay > MAX_DELAY {
            debug!(
                job_id = %job.id,
                delay_secs = delay.as_secs(),
                "requeue delay capped at sqs maximum"
            );
        }

        self.client
            .send_message()
            .queue_url(self.url(job.priority()))
            .message_body(body)
            .delay_seconds(to_i32(delay.min(MAX_DELAY).as_secs()))
            .send()
            .await
            .map_err(classify_error)?;

        // The copy is already published; a lapsed original surfaces as a
        // rare duplicate, which dedupe by job id absorbs.
        self.delete(&job.receipt).await
    }

    async fn dead_letter(&self, record: &DeadLetterRecord) -> Result<()> {
        let Some(url) = &self.config.dead_letter_url else {
            error!(
                job_id = %record.job_id,
                job_type = %record.job_type,
                queue = %record.queue,
                attempt = record.attempt,
                reason = %record.reason,
                "dead letter (no dead-letter queue configured)"
            );
            return Ok(());
        };

        self.client
            .send_message()
            .queue_url(url)
            .message_body(serde_json::to_string(record)?)
            .send()
            .await
            .map_err(classify_error)?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqs"
    }
}

fn to_i32(value: impl TryInto<i32>) -> i32 {
    value.try_into().unwrap_or(i32::MAX)
}

fn classify_error<E, R>(err: SdkError<E, R>) -> QueueError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            QueueError::unreachable(message)
        },
        _ => QueueError::backend(message),
    }
}

fn classify_receipt_error<E, R>(err: SdkError<E, R>, queue: QueueKind) -> QueueError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    if err.code().is_some_and(|code| EXPIRED_RECEIPT_CODES.contains(&code)) {
        return QueueError::ReceiptExpired { queue };
    }
    classify_error(err)
}
