//! Integration tests for the polling loop against the in-memory queue.
//!
//! Every test runs on a virtual clock: long polls, retry delays and idle
//! sleeps complete instantly while preserving their ordering.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use missive_core::{DeliveryOutcome, Job, JobId, QueueKind, ReceiptHandle, TestClock};
use missive_mail::{EmailDispatcher, EmailMessage};
use missive_queue::{DeadLetterRecord, InMemoryQueue, QueueClient, QueueError, QueueEvent};
use missive_testing::{
    digest_job, email_jobs, fixtures::malformed, EmailJobBuilder, TestEnv, DEFAULT_FROM,
};
use missive_worker::{
    CycleOutcome, HandlerRegistry, InMemoryLedger, JobProcessor, LoopConfig, LoopState,
    RetryPolicy, WorkerEngine, WorkerError, WorkerLoop,
};

/// Provider that stays pending for a few polls before succeeding.
#[derive(Debug)]
struct StallingProvider {
    stalls: u32,
}

#[async_trait]
impl EmailDispatcher for StallingProvider {
    async fn send(&self, _message: &EmailMessage) -> DeliveryOutcome {
        for _ in 0..self.stalls {
            tokio::task::yield_now().await;
        }
        DeliveryOutcome::Success
    }

    fn provider_name(&self) -> &'static str {
        "stalling"
    }
}

/// Provider whose sends take `took` of virtual time.
#[derive(Debug)]
struct SlowProvider {
    clock: TestClock,
    took: Duration,
    calls: AtomicU32,
}

#[async_trait]
impl EmailDispatcher for SlowProvider {
    async fn send(&self, _message: &EmailMessage) -> DeliveryOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.clock.advance(self.took);
        DeliveryOutcome::Success
    }

    fn provider_name(&self) -> &'static str {
        "slow"
    }
}

/// In-memory queue whose first `failures` polls fail.
#[derive(Debug)]
struct FlakyQueue {
    inner: InMemoryQueue,
    failures: AtomicU32,
}

#[async_trait]
impl QueueClient for FlakyQueue {
    async fn poll_batch(
        &self,
        queue: QueueKind,
        max_messages: usize,
        wait_time: Duration,
    ) -> missive_queue::Result<Vec<Job>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::unreachable("connection refused"));
        }
        self.inner.poll_batch(queue, max_messages, wait_time).await
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> missive_queue::Result<()> {
        self.inner.ack(receipt).await
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        extra: Duration,
    ) -> missive_queue::Result<()> {
        self.inner.extend_visibility(receipt, extra).await
    }

    async fn requeue(
        &self,
        job: &Job,
        next_attempt: u32,
        delay: Duration,
    ) -> missive_queue::Result<()> {
        self.inner.requeue(job, next_attempt, delay).await
    }

    async fn dead_letter(&self, record: &DeadLetterRecord) -> missive_queue::Result<()> {
        self.inner.dead_letter(record).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

async fn wait_for_ack(queue: &InMemoryQueue) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.acked().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn priority_queue_is_drained_before_regular_is_polled() -> Result<()> {
    let mut env = TestEnv::builder().batch_size(2).build().await;
    env.enqueue_all(QueueKind::Priority, &email_jobs("priority", 5)).await?;
    env.enqueue_all(QueueKind::Regular, &email_jobs("regular", 5)).await?;

    env.run_until_idle().await?;

    let journal = env.queue.journal().await;
    let last_priority_ack = journal
        .iter()
        .rposition(|event| matches!(event, QueueEvent::Acked { queue: QueueKind::Priority, .. }))
        .expect("priority jobs were acked");
    let first_regular_poll = journal
        .iter()
        .position(|event| matches!(event, QueueEvent::Polled { queue: QueueKind::Regular, .. }))
        .expect("regular queue was polled");

    assert!(
        last_priority_ack < first_regular_poll,
        "regular polled before priority drained: {journal:?}"
    );
    assert_eq!(env.queue.acked().await.len(), 10);
    assert_eq!(env.dispatcher.call_count().await, 10);
    Ok(())
}

#[tokio::test]
async fn starvation_guard_gives_regular_a_turn() -> Result<()> {
    let mut env =
        TestEnv::builder().batch_size(1).max_consecutive_priority_batches(2).build().await;
    env.enqueue_all(QueueKind::Priority, &email_jobs("priority", 5)).await?;
    env.enqueue_all(QueueKind::Regular, &email_jobs("regular", 2)).await?;

    env.run_until_idle().await?;

    let order: Vec<QueueKind> = env.batches().await.into_iter().map(|(queue, _)| queue).collect();
    use QueueKind::{Priority as P, Regular as R};
    assert_eq!(order, vec![P, P, R, P, P, R, P]);
    Ok(())
}

#[tokio::test]
async fn transient_failures_then_success_requeue_three_times() -> Result<()> {
    let mut env = TestEnv::builder()
        .max_retries(3)
        .outcomes([
            DeliveryOutcome::transient("connection reset"),
            DeliveryOutcome::transient("connection reset"),
            DeliveryOutcome::transient("connection reset"),
        ])
        .build()
        .await;
    env.enqueue(QueueKind::Regular, &EmailJobBuilder::new().id("job-1").build()).await?;

    env.run_until_idle().await?;

    let requeued = env.queue.requeued().await;
    let attempts: Vec<u32> = requeued.iter().map(|(_, attempt, _)| *attempt).collect();
    let delays: Vec<Duration> = requeued.iter().map(|(_, _, delay)| *delay).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(
        delays,
        vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
    );
    assert_eq!(env.queue.acked().await.len(), 1);
    assert!(env.dead_letters().await.is_empty());
    assert_eq!(env.dispatcher.call_count().await, 4);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered() -> Result<()> {
    let mut env = TestEnv::builder()
        .max_retries(2)
        .fallback(DeliveryOutcome::transient("service unavailable"))
        .build()
        .await;
    env.enqueue(QueueKind::Priority, &EmailJobBuilder::new().id("job-1").build()).await?;

    env.run_until_idle().await?;

    let dead = env.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job_id.as_str(), "job-1");
    assert_eq!(dead[0].attempt, 2);
    assert_eq!(dead[0].queue, QueueKind::Priority);
    assert!(dead[0].reason.contains("service unavailable"), "{}", dead[0].reason);
    assert_eq!(env.queue.requeued().await.len(), 2);
    assert_eq!(env.dispatcher.call_count().await, 3);
    Ok(())
}

#[tokio::test]
async fn permanent_failure_is_dead_lettered_without_retry() -> Result<()> {
    let mut env = TestEnv::builder()
        .fallback(DeliveryOutcome::permanent("550 mailbox unavailable"))
        .build()
        .await;
    env.enqueue(QueueKind::Regular, &EmailJobBuilder::new().id("job-1").build()).await?;

    env.run_until_idle().await?;

    assert_eq!(env.dead_letters().await.len(), 1);
    assert!(env.queue.requeued().await.is_empty());
    assert_eq!(env.dispatcher.call_count().await, 1);
    let stats = env.stats().await;
    assert_eq!((stats.dead_lettered, stats.acked), (1, 1));
    Ok(())
}

#[tokio::test]
async fn malformed_payloads_never_reach_the_provider() -> Result<()> {
    let mut env = TestEnv::new().await;
    env.enqueue_raw(QueueKind::Regular, malformed::NOT_JSON).await;
    env.enqueue_raw(QueueKind::Regular, malformed::MISSING_ID).await;
    env.enqueue_raw(QueueKind::Priority, malformed::BARE_STRING).await;
    env.enqueue(QueueKind::Regular, &EmailJobBuilder::new().id("no-body").without_body().build())
        .await?;

    env.run_until_idle().await?;

    assert_eq!(env.dead_letters().await.len(), 4);
    assert_eq!(env.dispatcher.call_count().await, 0);
    assert_eq!(env.queue.acked().await.len(), 4);
    Ok(())
}

#[tokio::test]
async fn duplicate_job_id_is_delivered_once() -> Result<()> {
    let mut env = TestEnv::new().await;
    let envelope = EmailJobBuilder::new().id("job-1").build();
    env.enqueue(QueueKind::Regular, &envelope).await?;
    env.enqueue(QueueKind::Priority, &envelope).await?;

    env.run_until_idle().await?;

    assert_eq!(env.dispatcher.call_count().await, 1);
    assert_eq!(env.queue.acked().await.len(), 2);
    assert_eq!(env.stats().await.duplicates, 1);
    Ok(())
}

#[tokio::test]
async fn digest_jobs_are_composed_into_one_email() -> Result<()> {
    let mut env = TestEnv::new().await;
    env.enqueue(QueueKind::Regular, &digest_job("digest-1", 2)).await?;

    env.run_until_idle().await?;

    let sent = env.dispatcher.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "Your digest: 2 new items");
    let text = sent[0].text.as_deref().unwrap_or_default();
    assert!(text.starts_with("1. Notice 1\n"), "{text}");
    assert!(text.contains("2. Notice 2\n"), "{text}");
    Ok(())
}

#[tokio::test]
async fn empty_queues_report_empty_cycle() -> Result<()> {
    let mut env = TestEnv::new().await;

    let outcome = env.run_cycle().await?;

    assert_eq!(outcome, CycleOutcome::Empty);
    assert_eq!(env.worker.state(), LoopState::Idle);
    assert_eq!(env.stats().await.cycles, 1);
    Ok(())
}

#[tokio::test]
async fn batch_outcome_names_its_queue() -> Result<()> {
    let mut env = TestEnv::new().await;
    env.enqueue_all(QueueKind::Priority, &email_jobs("priority", 3)).await?;

    let outcome = env.run_cycle().await?;

    assert_eq!(outcome, CycleOutcome::Processed { queue: QueueKind::Priority, count: 3 });
    assert_eq!(env.stats().await.priority_batches, 1);
    Ok(())
}

#[tokio::test]
async fn cancelled_loop_stops_without_polling() -> Result<()> {
    let mut env = TestEnv::new().await;
    env.worker.cancellation_token().cancel();

    env.worker.run().await?;

    assert_eq!(env.worker.state(), LoopState::Stopped);
    assert!(env.polls().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn engine_delivers_and_shuts_down_gracefully() -> Result<()> {
    let env = TestEnv::new().await;
    env.enqueue(QueueKind::Priority, &EmailJobBuilder::new().id("job-1").build()).await?;
    let TestEnv { worker, dispatcher, queue, .. } = env;

    let mut engine = WorkerEngine::new(worker);
    engine.start()?;
    assert!(engine.is_running());
    assert!(matches!(engine.start(), Err(WorkerError::AlreadyRunning)));

    wait_for_ack(&queue).await?;

    let mut state = engine.subscribe();
    engine.shutdown().await?;

    assert_eq!(*state.borrow_and_update(), LoopState::Stopped);
    assert_eq!(dispatcher.call_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn priority_batch_is_taken_whole_before_regular() -> Result<()> {
    let mut env = TestEnv::new().await;
    env.enqueue_all(QueueKind::Priority, &email_jobs("priority", 5)).await?;
    env.enqueue_all(QueueKind::Regular, &email_jobs("regular", 5)).await?;

    env.run_until_idle().await?;

    assert_eq!(env.batches().await, vec![(QueueKind::Priority, 5), (QueueKind::Regular, 5)]);
    Ok(())
}

#[tokio::test]
async fn overlapping_copies_in_one_batch_are_not_dead_lettered() -> Result<()> {
    let mut env = TestEnv::builder()
        .max_retries(0)
        .latency(Duration::from_millis(50))
        .build()
        .await;
    let envelope = EmailJobBuilder::new().id("job-1").build();
    env.enqueue(QueueKind::Regular, &envelope).await?;
    env.enqueue(QueueKind::Regular, &envelope).await?;

    env.run_until_idle().await?;

    assert_eq!(env.dispatcher.call_count().await, 1);
    assert!(env.dead_letters().await.is_empty());
    assert_eq!(
        env.queue.requeued().await,
        vec![(JobId::new("job-1"), 0, Duration::from_secs(1))]
    );
    assert_eq!(env.queue.acked().await.len(), 2);
    assert_eq!(env.stats().await.duplicates, 1);
    Ok(())
}

#[tokio::test]
async fn slow_delivery_keeps_extending_visibility() -> Result<()> {
    let config = LoopConfig {
        wait_time: Duration::from_secs(1),
        poll_interval: Duration::from_secs(1),
        visibility_extend_interval: Some(Duration::from_secs(10)),
        visibility_extension: Duration::from_secs(30),
        ..LoopConfig::default()
    };
    let mut env = TestEnv::builder()
        .loop_config(config)
        .provider(Arc::new(StallingProvider { stalls: 3 }))
        .build()
        .await;
    env.enqueue(QueueKind::Regular, &EmailJobBuilder::new().id("job-1").build()).await?;

    env.run_cycle().await?;

    let journal = env.queue.journal().await;
    assert!(
        journal.iter().any(|event| matches!(
            event,
            QueueEvent::VisibilityExtended { job_id, extra }
                if job_id.as_str() == "job-1" && *extra == Duration::from_secs(30)
        )),
        "no heartbeat recorded: {journal:?}"
    );
    let stats = env.stats().await;
    assert_eq!((stats.acked, stats.receipt_expired), (1, 0));
    Ok(())
}

#[tokio::test]
async fn lapsed_receipt_is_counted_and_redelivery_is_a_duplicate() -> Result<()> {
    let clock = TestClock::new();
    let provider = Arc::new(SlowProvider {
        clock: clock.clone(),
        took: Duration::from_secs(60),
        calls: AtomicU32::new(0),
    });
    let mut env = TestEnv::builder()
        .clock(clock)
        .visibility_timeout(Duration::from_secs(30))
        .provider(provider.clone())
        .build()
        .await;
    env.enqueue(QueueKind::Regular, &EmailJobBuilder::new().id("job-1").build()).await?;

    env.run_until_idle().await?;

    let journal = env.queue.journal().await;
    assert!(journal.iter().any(|event| matches!(event, QueueEvent::ReceiptRejected { .. })));
    assert_eq!(env.queue.acked().await, vec![JobId::new("job-1")]);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    let stats = env.stats().await;
    assert_eq!((stats.receipt_expired, stats.duplicates, stats.acked), (1, 1, 1));
    Ok(())
}

#[tokio::test]
async fn failed_polls_are_counted_and_the_loop_recovers() -> Result<()> {
    let clock = TestClock::new();
    let inner = InMemoryQueue::new(Arc::new(clock.clone()));
    inner.enqueue(QueueKind::Regular, &EmailJobBuilder::new().id("job-1").build()).await?;
    let queue = Arc::new(FlakyQueue { inner: inner.clone(), failures: AtomicU32::new(2) });

    let ledger = InMemoryLedger::new(
        Arc::new(clock.clone()),
        Duration::from_secs(86_400),
        Duration::from_secs(30),
    );
    let provider =
        SlowProvider { clock: clock.clone(), took: Duration::ZERO, calls: AtomicU32::new(0) };
    let processor = JobProcessor::new(
        HandlerRegistry::with_builtin(DEFAULT_FROM),
        Arc::new(provider),
        Arc::new(ledger),
        RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
    );
    let config = LoopConfig {
        wait_time: Duration::from_secs(1),
        poll_interval: Duration::from_secs(1),
        error_backoff: Duration::from_secs(1),
        ..LoopConfig::default()
    };
    let worker = WorkerLoop::new(queue, processor, config, Arc::new(clock));
    let stats = worker.stats();

    let mut engine = WorkerEngine::new(worker);
    engine.start()?;
    wait_for_ack(&inner).await?;
    engine.shutdown().await?;

    let stats = stats.read().await;
    assert_eq!(stats.poll_errors, 2);
    assert_eq!(stats.acked, 1);
    Ok(())
}

#[tokio::test]
async fn shutdown_gives_up_after_the_grace_period() -> Result<()> {
    let config = LoopConfig {
        wait_time: Duration::from_secs(1),
        poll_interval: Duration::from_secs(1),
        shutdown_grace_period: Duration::from_millis(50),
        ..LoopConfig::default()
    };
    let env = TestEnv::builder().loop_config(config).latency(Duration::from_secs(2)).build().await;
    env.enqueue(QueueKind::Regular, &EmailJobBuilder::new().id("job-1").build()).await?;

    let mut engine = WorkerEngine::new(env.worker);
    engine.start()?;
    tokio::time::timeout(Duration::from_secs(1), async {
        while engine.stats().await.in_flight == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    let result = engine.shutdown().await;

    assert!(
        matches!(result, Err(WorkerError::ShutdownTimeout { timeout })
            if timeout == Duration::from_millis(50)),
        "{result:?}"
    );
    assert!(env.queue.acked().await.is_empty());
    Ok(())
}
