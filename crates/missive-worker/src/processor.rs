//! Single-job pipeline: route, validate, dedupe, send, decide.
//!
//! The processor never touches the queue. It returns a
//! [`ProcessingResult`] and the worker loop applies it, which keeps every
//! queue side effect in one place and lets the pipeline be tested without a
//! backend.

use std::{sync::Arc, time::Duration};

use missive_core::{DeliveryOutcome, Job, ValidationError};
use missive_mail::{EmailDispatcher, EmailMessage};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    dedupe::{Claim, DeliveryLedger},
    handler::HandlerRegistry,
    retry::RetryPolicy,
    stats::{self, SharedStats},
};

/// What the worker loop must do with a processed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Remove the message; the job is done.
    Ack,
    /// Publish the job again with `next_attempt` after `delay`.
    Retry {
        /// How long the copy stays invisible
        delay: Duration,
        /// Attempt count carried by the copy
        next_attempt: u32,
    },
    /// Record the job as dead and remove the message.
    DeadLetter {
        /// Why the job was given up on
        reason: String,
    },
}

impl ProcessingResult {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Retry { .. } => "retry",
            Self::DeadLetter { .. } => "dead_letter",
        }
    }
}

/// Runs one job through its handler and the active provider.
#[derive(Debug, Clone)]
pub struct JobProcessor {
    handlers: Arc<HandlerRegistry>,
    dispatcher: Arc<dyn EmailDispatcher>,
    ledger: Arc<dyn DeliveryLedger>,
    policy: RetryPolicy,
    stats: SharedStats,
}

impl JobProcessor {
    /// Creates a processor with its own statistics.
    pub fn new(
        handlers: HandlerRegistry,
        dispatcher: Arc<dyn EmailDispatcher>,
        ledger: Arc<dyn DeliveryLedger>,
        policy: RetryPolicy,
    ) -> Self {
        Self { handlers: Arc::new(handlers), dispatcher, ledger, policy, stats: stats::shared() }
    }

    /// Statistics handle this processor writes to.
    pub fn stats(&self) -> SharedStats {
        self.stats.clone()
    }

    /// Processes `job` and decides its fate.
    pub async fn process(&self, job: &Job) -> ProcessingResult {
        let span = info_span!(
            "process_job",
            job_id = %job.id,
            job_type = %job.job_type,
            queue = %job.priority(),
            attempt = job.attempt,
        );

        async {
            let result = self.run(job).await;
            let action = result.label();
            match &result {
                ProcessingResult::Ack => info!(action, "job completed"),
                ProcessingResult::Retry { delay, next_attempt } => warn!(
                    action,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    next_attempt,
                    "job will be retried"
                ),
                ProcessingResult::DeadLetter { reason } => {
                    error!(action, reason = %reason, "job will be dead-lettered");
                },
            }
            self.stats.write().await.jobs_processed += 1;
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, job: &Job) -> ProcessingResult {
        let message = match self.build(job) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "job failed validation");
                return ProcessingResult::DeadLetter { reason: err.to_string() };
            },
        };

        let claimed = match self.ledger.begin(&job.id).await {
            Ok(Claim::Fresh) => true,
            Ok(Claim::AlreadyDelivered) => {
                info!("job already delivered, skipping provider");
                self.stats.write().await.duplicates += 1;
                return ProcessingResult::Ack;
            },
            // Another receipt holds the claim. Check back later without
            // spending an attempt; the claim lapses with its visibility.
            Ok(Claim::InFlight) => {
                let delay = self.policy.delay_for(job.attempt, None);
                info!("job is in flight on another worker, checking back later");
                return ProcessingResult::Retry { delay, next_attempt: job.attempt };
            },
            Err(err) => {
                warn!(error = %err, "delivery ledger unavailable, sending without dedupe");
                false
            },
        };

        let outcome = self.dispatcher.send(&message).await;
        debug!(
            provider = self.dispatcher.provider_name(),
            outcome = outcome.label(),
            "provider answered"
        );

        if outcome.is_success() {
            self.stats.write().await.delivered += 1;
        }
        if claimed {
            self.settle_claim(job, &outcome).await;
        }

        self.policy.decide(job.attempt, &outcome)
    }

    fn build(&self, job: &Job) -> Result<EmailMessage, ValidationError> {
        if let Some(decode_error) = &job.decode_error {
            return Err(ValidationError::MalformedEnvelope(decode_error.clone()));
        }
        self.handlers.resolve(&job.job_type)?.build(job)
    }

    async fn settle_claim(&self, job: &Job, outcome: &DeliveryOutcome) {
        let settled = if outcome.is_success() {
            self.ledger.mark_delivered(&job.id).await
        } else {
            self.ledger.release(&job.id).await
        };
        if let Err(err) = settled {
            warn!(error = %err, "failed to update delivery ledger");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use missive_core::{JobEnvelope, JobId, JobType, QueueKind, ReceiptHandle, TestClock};
    use missive_mail::ScriptedDispatcher;
    use serde_json::json;

    use super::*;
    use crate::dedupe::InMemoryLedger;

    fn processor(dispatcher: &ScriptedDispatcher) -> JobProcessor {
        let clock = Arc::new(TestClock::new());
        let ledger =
            InMemoryLedger::new(clock, Duration::from_secs(3600), Duration::from_secs(30));
        JobProcessor::new(
            HandlerRegistry::with_builtin("office@school.example"),
            Arc::new(dispatcher.clone()),
            Arc::new(ledger),
            RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
        )
    }

    fn email_job(id: &str, attempt: u32) -> Job {
        let payload = json!({ "to": "parent@example.com", "subject": "Trip", "text": "Coats" });
        let mut envelope = JobEnvelope::new(id, JobType::SendEmail, payload);
        envelope.attempt = attempt;
        Job::from_envelope(envelope, ReceiptHandle::new(QueueKind::Regular, id), Utc::now())
    }

    #[tokio::test]
    async fn success_acks_and_counts_delivery() {
        let dispatcher = ScriptedDispatcher::succeeding();
        let processor = processor(&dispatcher);

        let result = processor.process(&email_job("job-1", 0)).await;

        assert_eq!(result, ProcessingResult::Ack);
        assert_eq!(dispatcher.call_count().await, 1);
        let stats = processor.stats().read().await.clone();
        assert_eq!((stats.jobs_processed, stats.delivered), (1, 1));
    }

    #[tokio::test]
    async fn transient_failure_retries_with_next_attempt() {
        let dispatcher = ScriptedDispatcher::with_outcomes([DeliveryOutcome::transient("reset")]);
        let processor = processor(&dispatcher);

        let result = processor.process(&email_job("job-1", 2)).await;

        assert_eq!(
            result,
            ProcessingResult::Retry { delay: Duration::from_secs(4), next_attempt: 3 }
        );
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let dispatcher =
            ScriptedDispatcher::with_outcomes([DeliveryOutcome::permanent("550 no such user")]);
        let processor = processor(&dispatcher);

        let result = processor.process(&email_job("job-1", 0)).await;

        match result {
            ProcessingResult::DeadLetter { reason } => assert!(reason.contains("550"), "{reason}"),
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_envelope_never_reaches_provider() {
        let dispatcher = ScriptedDispatcher::succeeding();
        let processor = processor(&dispatcher);
        let job = Job::decode(
            "{not json",
            "msg-1",
            ReceiptHandle::new(QueueKind::Priority, "r-1"),
            Utc::now(),
        );

        let result = processor.process(&job).await;

        match result {
            ProcessingResult::DeadLetter { reason } => assert!(reason.contains("malformed")),
            other => panic!("expected dead letter, got {other:?}"),
        }
        assert_eq!(dispatcher.call_count().await, 0);
    }

    #[tokio::test]
    async fn invalid_payload_never_reaches_provider() {
        let dispatcher = ScriptedDispatcher::succeeding();
        let processor = processor(&dispatcher);
        let job = Job::from_envelope(
            JobEnvelope::new("job-1", JobType::SendEmail, json!({ "to": "parent@example.com" })),
            ReceiptHandle::new(QueueKind::Regular, "r-1"),
            Utc::now(),
        );

        let result = processor.process(&job).await;

        assert!(matches!(result, ProcessingResult::DeadLetter { .. }));
        assert_eq!(dispatcher.call_count().await, 0);
    }

    #[tokio::test]
    async fn redelivered_job_is_not_sent_twice() {
        let dispatcher = ScriptedDispatcher::succeeding();
        let processor = processor(&dispatcher);

        let first = processor.process(&email_job("job-1", 0)).await;
        let second = processor.process(&email_job("job-1", 0)).await;

        assert_eq!((first, second), (ProcessingResult::Ack, ProcessingResult::Ack));
        assert_eq!(dispatcher.call_count().await, 1);
        assert_eq!(processor.stats().read().await.duplicates, 1);
    }

    #[tokio::test]
    async fn job_claimed_elsewhere_is_retried_without_spending_an_attempt() {
        let dispatcher = ScriptedDispatcher::succeeding();
        let clock = Arc::new(TestClock::new());
        let ledger =
            InMemoryLedger::new(clock, Duration::from_secs(3600), Duration::from_secs(30));
        let processor = JobProcessor::new(
            HandlerRegistry::with_builtin("office@school.example"),
            Arc::new(dispatcher.clone()),
            Arc::new(ledger.clone()),
            RetryPolicy { max_retries: 0, jitter_factor: 0.0, ..RetryPolicy::default() },
        );
        ledger.begin(&JobId::new("job-1")).await.unwrap();

        let result = processor.process(&email_job("job-1", 0)).await;

        assert_eq!(
            result,
            ProcessingResult::Retry { delay: Duration::from_secs(1), next_attempt: 0 }
        );
        assert_eq!(dispatcher.call_count().await, 0);
    }

    #[tokio::test]
    async fn failed_attempt_releases_claim_for_retry() {
        let dispatcher = ScriptedDispatcher::with_outcomes([DeliveryOutcome::transient("busy")]);
        let processor = processor(&dispatcher);

        processor.process(&email_job("job-1", 0)).await;
        let retried = processor.process(&email_job("job-1", 1)).await;

        assert_eq!(retried, ProcessingResult::Ack);
        assert_eq!(dispatcher.call_count().await, 2);
    }
}
