//! Test infrastructure for deterministic worker testing.
//!
//! Wires an [`InMemoryQueue`], a [`ScriptedDispatcher`] and an
//! [`InMemoryLedger`] to a real [`WorkerLoop`], all driven by one
//! [`TestClock`]. Tests enqueue envelopes, script provider outcomes and step
//! the loop cycle by cycle; nothing touches the network and no test waits on
//! wall-clock time.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use missive_core::{DeliveryOutcome, JobEnvelope, QueueKind, TestClock};
use missive_mail::{EmailDispatcher, ScriptedDispatcher};
use missive_queue::{DeadLetterRecord, InMemoryQueue, QueueEvent};
use missive_worker::{
    CycleOutcome, HandlerRegistry, InMemoryLedger, JobProcessor, LoopConfig, RetryPolicy,
    WorkerLoop, WorkerStats,
};

pub mod fixtures;

pub use fixtures::{digest_job, email_jobs, EmailJobBuilder};

/// Sender used when a payload has none.
pub const DEFAULT_FROM: &str = "Missive <noreply@missive.test>";

/// Upper bound for [`TestEnv::run_until_idle`].
pub const MAX_IDLE_CYCLES: usize = 500;

/// Builder for [`TestEnv`].
#[derive(Debug, Clone)]
pub struct TestEnvBuilder {
    policy: RetryPolicy,
    loop_config: LoopConfig,
    outcomes: Vec<DeliveryOutcome>,
    fallback: DeliveryOutcome,
    visibility_timeout: Duration,
    latency: Duration,
    clock: Option<TestClock>,
    provider: Option<Arc<dyn EmailDispatcher>>,
}

impl TestEnvBuilder {
    /// Deterministic defaults: no jitter, batches of 10, one-second polls.
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
            loop_config: LoopConfig {
                wait_time: Duration::from_secs(1),
                poll_interval: Duration::from_secs(1),
                error_backoff: Duration::from_secs(1),
                ..LoopConfig::default()
            },
            outcomes: Vec::new(),
            fallback: DeliveryOutcome::Success,
            visibility_timeout: Duration::from_secs(30),
            latency: Duration::ZERO,
            clock: None,
            provider: None,
        }
    }

    /// Transient failures tolerated per job.
    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Messages per poll and jobs processed at once.
    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.loop_config.batch_size = batch_size;
        self.loop_config.concurrency = batch_size;
        self
    }

    /// Jobs processed at once.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.loop_config.concurrency = concurrency;
        self
    }

    /// Consecutive priority batches before regular gets a turn.
    #[must_use]
    pub fn max_consecutive_priority_batches(mut self, max: u32) -> Self {
        self.loop_config.max_consecutive_priority_batches = max;
        self
    }

    /// Replaces the whole loop configuration.
    #[must_use]
    pub fn loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    /// Provider outcomes played back in call order.
    #[must_use]
    pub fn outcomes(mut self, outcomes: impl IntoIterator<Item = DeliveryOutcome>) -> Self {
        self.outcomes.extend(outcomes);
        self
    }

    /// Outcome once the scripted ones run out.
    #[must_use]
    pub fn fallback(mut self, outcome: DeliveryOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    /// Visibility timeout of the in-memory queue and the ledger's claims.
    #[must_use]
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Real time the scripted dispatcher takes per call, so jobs in one
    /// batch overlap.
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Shares `clock` instead of starting a fresh one.
    #[must_use]
    pub fn clock(mut self, clock: TestClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sends through `provider` instead of the scripted dispatcher, which
    /// then records nothing.
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn EmailDispatcher>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Builds the environment.
    pub async fn build(self) -> TestEnv {
        let clock = self.clock.unwrap_or_default();
        let queue = InMemoryQueue::with_visibility_timeout(
            Arc::new(clock.clone()),
            self.visibility_timeout,
        );

        let dispatcher =
            ScriptedDispatcher::with_fallback(self.fallback).with_latency(self.latency);
        for outcome in self.outcomes {
            dispatcher.push(outcome).await;
        }

        let ledger = InMemoryLedger::new(
            Arc::new(clock.clone()),
            Duration::from_secs(86_400),
            self.visibility_timeout,
        );
        let provider: Arc<dyn EmailDispatcher> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(dispatcher.clone()),
        };
        let processor = JobProcessor::new(
            HandlerRegistry::with_builtin(DEFAULT_FROM),
            provider,
            Arc::new(ledger.clone()),
            self.policy,
        );
        let worker = WorkerLoop::new(
            Arc::new(queue.clone()),
            processor,
            self.loop_config,
            Arc::new(clock.clone()),
        );

        TestEnv { clock, queue, dispatcher, ledger, worker }
    }
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A worker loop with every dependency held in process.
#[derive(Debug)]
pub struct TestEnv {
    /// Virtual clock shared by every component
    pub clock: TestClock,
    /// Queue the worker polls
    pub queue: InMemoryQueue,
    /// Provider stand-in
    pub dispatcher: ScriptedDispatcher,
    /// Delivery ledger
    pub ledger: InMemoryLedger,
    /// The loop under test
    pub worker: WorkerLoop,
}

impl TestEnv {
    /// Environment with default settings and an always-succeeding provider.
    pub async fn new() -> Self {
        TestEnvBuilder::new().build().await
    }

    /// Starts a builder.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Publishes `envelope` to `queue`.
    pub async fn enqueue(&self, queue: QueueKind, envelope: &JobEnvelope) -> Result<()> {
        self.queue.enqueue(queue, envelope).await.context("failed to enqueue test job")
    }

    /// Publishes every envelope to `queue`.
    pub async fn enqueue_all(&self, queue: QueueKind, envelopes: &[JobEnvelope]) -> Result<()> {
        for envelope in envelopes {
            self.enqueue(queue, envelope).await?;
        }
        Ok(())
    }

    /// Publishes a raw body to `queue`.
    pub async fn enqueue_raw(&self, queue: QueueKind, body: &str) {
        self.queue.enqueue_raw(queue, body).await;
    }

    /// Runs one worker cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        Ok(self.worker.run_once().await?)
    }

    /// Runs cycles until both queues are drained and nothing is delayed or
    /// in flight. Returns the number of cycles run.
    ///
    /// Each empty cycle moves the virtual clock a further second so delayed
    /// copies come due.
    pub async fn run_until_idle(&mut self) -> Result<usize> {
        for cycle in 1..=MAX_IDLE_CYCLES {
            if self.run_cycle().await? == CycleOutcome::Empty {
                if self.is_idle().await {
                    return Ok(cycle);
                }
                self.clock.advance(Duration::from_secs(1));
            }
        }
        anyhow::bail!("worker did not go idle within {MAX_IDLE_CYCLES} cycles")
    }

    /// True when no message is ready, delayed or held.
    pub async fn is_idle(&self) -> bool {
        for queue in QueueKind::ALL {
            if self.queue.ready_len(queue).await > 0 {
                return false;
            }
        }
        self.queue.delayed_len().await == 0
            && self.queue.in_flight_len().await == 0
    }

    /// Moves virtual time forward.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Snapshot of worker statistics.
    pub async fn stats(&self) -> WorkerStats {
        self.worker.stats().read().await.clone()
    }

    /// Dead-letter records written so far.
    pub async fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.queue.dead_letters().await
    }

    /// Queues polled with a non-empty result, in order.
    pub async fn batches(&self) -> Vec<(QueueKind, usize)> {
        self.queue
            .journal()
            .await
            .into_iter()
            .filter_map(|event| match event {
                QueueEvent::Polled { queue, count } if count > 0 => Some((queue, count)),
                _ => None,
            })
            .collect()
    }

    /// Every poll, empty ones included, in order.
    pub async fn polls(&self) -> Vec<QueueKind> {
        self.queue
            .journal()
            .await
            .into_iter()
            .filter_map(|event| match event {
                QueueEvent::Polled { queue, .. } => Some(queue),
                _ => None,
            })
            .collect()
    }
}
