//! End-to-end tests for complete notification delivery workflows.
//!
//! Runs the real worker loop, processor and SendGrid adapter against the
//! in-memory queue and a mock HTTP provider, so provider status codes flow
//! through failure classification and the retry policy into queue actions.

use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use missive_core::{DeliveryOutcome, QueueKind};
use missive_mail::{sendgrid::SendGridDispatcher, EmailDispatcher, SendGridConfig};
use missive_testing::{EmailJobBuilder, TestEnv};
use proptest::prelude::*;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

async fn sendgrid(server: &MockServer) -> Result<Arc<dyn EmailDispatcher>> {
    let config = SendGridConfig {
        api_key: "SG.test".to_string(),
        api_url: server.uri(),
        timeout: Duration::from_secs(5),
    };
    Ok(Arc::new(SendGridDispatcher::new(&config)?))
}

fn mail_send() -> wiremock::MockBuilder {
    Mock::given(matchers::method("POST")).and(matchers::path("/v3/mail/send"))
}

/// The golden path: provider outages are retried with exponential backoff
/// until the message is accepted.
#[tokio::test]
async fn golden_delivery_with_retry_backoff() -> Result<()> {
    let server = MockServer::start().await;
    mail_send()
        .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    mail_send().respond_with(ResponseTemplate::new(202)).expect(1).mount(&server).await;

    let provider = sendgrid(&server).await?;
    let mut env = TestEnv::builder().max_retries(3).provider(provider).build().await;
    env.enqueue(QueueKind::Regular, &EmailJobBuilder::new().id("trip-reminder").build()).await?;

    env.run_until_idle().await?;

    let requeued = env.queue.requeued().await;
    let delays: Vec<Duration> = requeued.iter().map(|(_, _, delay)| *delay).collect();
    assert_eq!(
        delays,
        vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
    );
    assert_eq!(env.queue.acked().await.len(), 1);
    assert!(env.dead_letters().await.is_empty());
    assert_eq!(env.stats().await.delivered, 1);
    Ok(())
}

/// A rejected request is permanent: one call, one dead letter, no retry.
#[tokio::test]
async fn provider_rejection_is_dead_lettered_once() -> Result<()> {
    let server = MockServer::start().await;
    mail_send()
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid from address"))
        .expect(1)
        .mount(&server)
        .await;

    let mut env = TestEnv::builder().provider(sendgrid(&server).await?).build().await;
    env.enqueue(QueueKind::Priority, &EmailJobBuilder::new().id("bad-sender").build()).await?;

    env.run_until_idle().await?;

    let dead = env.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.starts_with("permanent failure"), "{}", dead[0].reason);
    assert!(env.queue.requeued().await.is_empty());
    Ok(())
}

/// Rate limiting waits at least as long as the provider asked.
#[tokio::test]
async fn rate_limit_hint_sets_retry_delay() -> Result<()> {
    let server = MockServer::start().await;
    mail_send()
        .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "120"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mail_send().respond_with(ResponseTemplate::new(202)).mount(&server).await;

    let mut env = TestEnv::builder().provider(sendgrid(&server).await?).build().await;
    env.enqueue(QueueKind::Regular, &EmailJobBuilder::new().id("newsletter").build()).await?;

    env.run_until_idle().await?;

    let requeued = env.queue.requeued().await;
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].2, Duration::from_secs(120));
    assert_eq!(env.queue.acked().await.len(), 1);
    Ok(())
}

/// Unreachable provider counts as transient and exhausts the retry budget.
#[tokio::test]
async fn unreachable_provider_exhausts_retries() -> Result<()> {
    let config = SendGridConfig {
        api_key: "SG.test".to_string(),
        api_url: "http://127.0.0.1:9".to_string(),
        timeout: Duration::from_secs(2),
    };
    let provider: Arc<dyn EmailDispatcher> = Arc::new(SendGridDispatcher::new(&config)?);

    let mut env = TestEnv::builder().max_retries(1).provider(provider).build().await;
    env.enqueue(QueueKind::Regular, &EmailJobBuilder::new().id("offline").build()).await?;

    env.run_until_idle().await?;

    assert_eq!(env.queue.requeued().await.len(), 1);
    let dead = env.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.starts_with("retries exhausted"), "{}", dead[0].reason);
    Ok(())
}

fn queue_strategy() -> impl Strategy<Value = QueueKind> {
    prop_oneof![Just(QueueKind::Priority), Just(QueueKind::Regular)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: every message is acked exactly once and every job id
    /// reaches the provider exactly once, however often it is published.
    #[test]
    fn duplicate_publications_deliver_once(
        publications in prop::collection::vec((0usize..6, queue_strategy()), 1..30),
        batch_size in 1usize..=10,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut env = TestEnv::builder().batch_size(batch_size).build().await;
            for (id, queue) in &publications {
                let envelope = EmailJobBuilder::new().id(format!("job-{id}")).build();
                env.enqueue(*queue, &envelope).await.unwrap();
            }

            env.run_until_idle().await.unwrap();

            let unique: HashSet<usize> = publications.iter().map(|(id, _)| *id).collect();
            prop_assert_eq!(env.dispatcher.call_count().await, unique.len());
            prop_assert_eq!(env.queue.acked().await.len(), publications.len());
            prop_assert!(env.dead_letters().await.is_empty());
            Ok(())
        })?;
    }

    /// Property: a permanent failure is dead-lettered on the first attempt
    /// whatever the retry budget.
    #[test]
    fn permanent_failure_is_never_retried(
        max_retries in 0u32..10,
        jobs in 1usize..8,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut env = TestEnv::builder()
                .max_retries(max_retries)
                .fallback(DeliveryOutcome::permanent("550 mailbox unavailable"))
                .build()
                .await;
            env.enqueue_all(QueueKind::Regular, &missive_testing::email_jobs("job", jobs))
                .await
                .unwrap();

            env.run_until_idle().await.unwrap();

            prop_assert_eq!(env.dispatcher.call_count().await, jobs);
            prop_assert_eq!(env.dead_letters().await.len(), jobs);
            prop_assert!(env.queue.requeued().await.is_empty());
            Ok(())
        })?;
    }
}
