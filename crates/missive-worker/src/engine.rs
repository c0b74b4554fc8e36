//! Priority-aware polling loop and its lifecycle.
//!
//! One [`WorkerLoop`] runs per process. Each cycle polls the priority queue
//! first and falls through to the regular queue only when priority is empty
//! or the starvation guard trips. A batch is processed concurrently up to the
//! configured limit, and each job's [`ProcessingResult`] is applied to the
//! queue before the next poll.
//!
//! # State machine
//!
//! ```text
//! IDLE ─▶ POLL_PRIORITY ──(jobs)──▶ PROCESS_BATCH ─▶ IDLE
//!              │
//!           (empty, or guard tripped)
//!              ▼
//!         POLL_REGULAR ──(jobs)──▶ PROCESS_BATCH ─▶ IDLE
//!              │
//!           (empty)
//!              ▼
//!           SLEEP ─▶ IDLE
//!
//! cancellation ─▶ (drain current batch) ─▶ STOPPED
//! ```
//!
//! [`WorkerEngine`] owns the spawned loop and implements graceful shutdown.

use std::{fmt, sync::Arc, time::Duration};

use missive_core::{Clock, Job, QueueKind};
use missive_queue::{DeadLetterRecord, QueueClient, QueueError};
use tokio::{
    sync::{watch, Semaphore},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, WorkerError},
    processor::{JobProcessor, ProcessingResult},
    stats::{SharedStats, WorkerStats},
};

/// Tuning for the polling loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    /// Messages requested per poll.
    pub batch_size: usize,
    /// Jobs processed at once within a batch.
    pub concurrency: usize,
    /// Long-poll duration for the regular queue.
    pub wait_time: Duration,
    /// Wait for the priority queue; zero makes it a short poll.
    pub priority_wait_time: Duration,
    /// Sleep after a cycle that found both queues empty.
    pub poll_interval: Duration,
    /// Consecutive priority batches before regular gets a turn.
    pub max_consecutive_priority_batches: u32,
    /// Visibility heartbeat period; `None` disables the heartbeat.
    pub visibility_extend_interval: Option<Duration>,
    /// Visibility granted by each heartbeat.
    pub visibility_extension: Duration,
    /// Sleep after a failed poll.
    pub error_backoff: Duration,
    /// How long shutdown waits for the current batch.
    pub shutdown_grace_period: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 10,
            wait_time: Duration::from_secs(20),
            priority_wait_time: Duration::ZERO,
            poll_interval: Duration::from_secs(5),
            max_consecutive_priority_batches: 5,
            visibility_extend_interval: None,
            visibility_extension: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
            shutdown_grace_period: Duration::from_secs(30),
        }
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopState {
    /// Between cycles.
    #[default]
    Idle,
    /// Waiting on the priority queue.
    PollPriority,
    /// Waiting on the regular queue.
    PollRegular,
    /// Processing a batch.
    ProcessBatch,
    /// Both queues were empty; waiting for the next cycle.
    Sleep,
    /// Terminated.
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "IDLE",
            Self::PollPriority => "POLL_PRIORITY",
            Self::PollRegular => "POLL_REGULAR",
            Self::ProcessBatch => "PROCESS_BATCH",
            Self::Sleep => "SLEEP",
            Self::Stopped => "STOPPED",
        })
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Processed a batch of `count` jobs from `queue`.
    Processed {
        /// Queue the batch came from
        queue: QueueKind,
        /// Jobs in the batch
        count: usize,
    },
    /// Both queues were empty.
    Empty,
    /// Shutdown was requested while polling.
    Cancelled,
}

/// State shared with the per-job tasks.
#[derive(Debug)]
struct Shared {
    queue: Arc<dyn QueueClient>,
    processor: JobProcessor,
    clock: Arc<dyn Clock>,
    stats: SharedStats,
    config: LoopConfig,
}

/// The polling loop.
#[derive(Debug)]
pub struct WorkerLoop {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    cancellation: CancellationToken,
    state: watch::Sender<LoopState>,
    consecutive_priority: u32,
}

impl WorkerLoop {
    /// Creates a loop over `queue`. Statistics are shared with `processor`.
    pub fn new(
        queue: Arc<dyn QueueClient>,
        processor: JobProcessor,
        config: LoopConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let stats = processor.stats();
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            shared: Arc::new(Shared { queue, processor, clock, stats, config }),
            permits,
            cancellation: CancellationToken::new(),
            state,
            consecutive_priority: 0,
        }
    }

    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Receiver following state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Statistics handle.
    pub fn stats(&self) -> SharedStats {
        self.shared.stats.clone()
    }

    /// Current state.
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    fn transition(&self, next: LoopState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "worker state");
        }
    }

    /// Runs cycles until cancelled.
    ///
    /// Poll failures abort only the current cycle. The batch in progress
    /// when cancellation arrives is finished before returning.
    pub async fn run(&mut self) -> Result<()> {
        let config = &self.shared.config;
        info!(
            backend = self.shared.queue.backend_name(),
            batch_size = config.batch_size,
            concurrency = config.concurrency,
            max_consecutive_priority_batches = config.max_consecutive_priority_batches,
            "worker loop starting"
        );

        loop {
            if self.cancellation.is_cancelled() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(CycleOutcome::Processed { .. }) => None,
                Ok(CycleOutcome::Empty) => Some(self.shared.config.poll_interval),
                Ok(CycleOutcome::Cancelled) => break,
                Err(err) => {
                    self.shared.stats.write().await.poll_errors += 1;
                    error!(error = %err, "poll failed, backing off");
                    Some(self.shared.config.error_backoff)
                },
            };

            if let Some(pause) = pause {
                self.transition(LoopState::Sleep);
                tokio::select! {
                    () = self.shared.clock.sleep(pause) => {},
                    () = self.cancellation.cancelled() => break,
                }
            }
        }

        self.transition(LoopState::Stopped);
        info!("worker loop stopped");
        Ok(())
    }

    /// Runs a single cycle: poll priority, maybe poll regular, process.
    ///
    /// # Errors
    ///
    /// Returns the queue error of a failed poll. Failures while applying
    /// results are logged and counted, never returned.
    pub async fn run_once(&mut self) -> Result<CycleOutcome> {
        self.transition(LoopState::Idle);
        let outcome = self.cycle().await;
        self.shared.stats.write().await.cycles += 1;
        if !matches!(outcome, Ok(CycleOutcome::Cancelled)) {
            self.transition(LoopState::Idle);
        }
        outcome
    }

    async fn cycle(&mut self) -> Result<CycleOutcome> {
        let max_streak = self.shared.config.max_consecutive_priority_batches;
        if self.consecutive_priority >= max_streak {
            debug!(
                consecutive = self.consecutive_priority,
                "priority starvation guard tripped, giving regular a turn"
            );
            self.consecutive_priority = 0;
            if let Some(outcome) = self.take_batch(QueueKind::Regular, Duration::ZERO).await? {
                return Ok(outcome);
            }
        }

        let priority_wait = self.shared.config.priority_wait_time;
        if let Some(outcome) = self.take_batch(QueueKind::Priority, priority_wait).await? {
            if matches!(outcome, CycleOutcome::Processed { .. }) {
                self.consecutive_priority += 1;
            }
            return Ok(outcome);
        }

        self.consecutive_priority = 0;
        let wait = self.shared.config.wait_time;
        Ok(self.take_batch(QueueKind::Regular, wait).await?.unwrap_or(CycleOutcome::Empty))
    }

    /// Polls `queue` and processes what arrived. `None` when it was empty.
    async fn take_batch(
        &mut self,
        queue: QueueKind,
        wait: Duration,
    ) -> Result<Option<CycleOutcome>> {
        self.transition(match queue {
            QueueKind::Priority => LoopState::PollPriority,
            QueueKind::Regular => LoopState::PollRegular,
        });

        let Some(jobs) = self.poll(queue, wait).await? else {
            return Ok(Some(CycleOutcome::Cancelled));
        };
        if jobs.is_empty() {
            return Ok(None);
        }

        {
            let mut stats = self.shared.stats.write().await;
            match queue {
                QueueKind::Priority => stats.priority_batches += 1,
                QueueKind::Regular => stats.regular_batches += 1,
            }
        }
        Ok(Some(self.process_batch(queue, jobs).await))
    }

    /// Polls `queue`, giving up early when shutdown is requested.
    async fn poll(&self, queue: QueueKind, wait: Duration) -> Result<Option<Vec<Job>>> {
        let max = self.shared.config.batch_size;
        tokio::select! {
            polled = self.shared.queue.poll_batch(queue, max, wait) => Ok(Some(polled?)),
            () = self.cancellation.cancelled() => Ok(None),
        }
    }

    async fn process_batch(&self, queue: QueueKind, jobs: Vec<Job>) -> CycleOutcome {
        self.transition(LoopState::ProcessBatch);
        let count = jobs.len();
        debug!(queue = %queue, count, "processing batch");

        let mut tasks = JoinSet::new();
        for job in jobs {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let shared = self.shared.clone();
            tasks.spawn(async move {
                let _permit = permit;
                shared.handle(job).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(join_error) = joined {
                let err = WorkerError::task_panic("job", &join_error);
                error!(error = %err, "job task failed");
                let mut stats = self.shared.stats.write().await;
                stats.in_flight = stats.in_flight.saturating_sub(1);
            }
        }

        CycleOutcome::Processed { queue, count }
    }
}

impl Shared {
    /// Processes one job and applies the result to the queue.
    async fn handle(&self, job: Job) {
        self.stats.write().await.in_flight += 1;

        let result = match self.config.visibility_extend_interval {
            Some(interval) if !interval.is_zero() => {
                self.process_with_heartbeat(&job, interval).await
            },
            _ => self.processor.process(&job).await,
        };
        self.apply(&job, result).await;

        let mut stats = self.stats.write().await;
        stats.in_flight = stats.in_flight.saturating_sub(1);
    }

    /// Keeps the message hidden while a slow delivery is in progress.
    async fn process_with_heartbeat(&self, job: &Job, interval: Duration) -> ProcessingResult {
        let work = self.processor.process(job);
        tokio::pin!(work);

        loop {
            tokio::select! {
                biased;
                result = &mut work => return result,
                () = self.clock.sleep(interval) => {
                    let extension = self.config.visibility_extension;
                    match self.queue.extend_visibility(&job.receipt, extension).await {
                        Ok(()) => debug!(job_id = %job.id, "visibility extended"),
                        Err(err) => self.record_queue_error(job, "extend_visibility", &err).await,
                    }
                },
            }
        }
    }

    async fn apply(&self, job: &Job, result: ProcessingResult) {
        match result {
            ProcessingResult::Ack => self.ack(job).await,
            ProcessingResult::Retry { delay, next_attempt } => {
                match self.queue.requeue(job, next_attempt, delay).await {
                    Ok(()) => self.stats.write().await.requeued += 1,
                    Err(err) => self.record_queue_error(job, "requeue", &err).await,
                }
            },
            ProcessingResult::DeadLetter { reason } => {
                let record = DeadLetterRecord::new(job, reason, self.clock.now_utc());
                match self.queue.dead_letter(&record).await {
                    Ok(()) => {
                        self.stats.write().await.dead_lettered += 1;
                        self.ack(job).await;
                    },
                    // Left unacked so the message comes back and is dead-lettered again.
                    Err(err) => self.record_queue_error(job, "dead_letter", &err).await,
                }
            },
        }
    }

    async fn ack(&self, job: &Job) {
        match self.queue.ack(&job.receipt).await {
            Ok(()) => self.stats.write().await.acked += 1,
            Err(err) => self.record_queue_error(job, "ack", &err).await,
        }
    }

    async fn record_queue_error(&self, job: &Job, operation: &'static str, err: &QueueError) {
        let mut stats = self.stats.write().await;
        if err.is_receipt_expired() {
            stats.receipt_expired += 1;
            warn!(
                job_id = %job.id,
                operation,
                "receipt expired before {operation}, message may be redelivered"
            );
        } else {
            stats.queue_errors += 1;
            error!(job_id = %job.id, operation, error = %err, "queue operation failed");
        }
    }
}

/// Owns the spawned loop: start, observe, shut down.
pub struct WorkerEngine {
    worker: Option<WorkerLoop>,
    handle: Option<JoinHandle<Result<()>>>,
    cancellation: CancellationToken,
    stats: SharedStats,
    state: watch::Receiver<LoopState>,
    grace_period: Duration,
}

impl WorkerEngine {
    /// Wraps a loop that has not started yet.
    pub fn new(worker: WorkerLoop) -> Self {
        Self {
            cancellation: worker.cancellation_token(),
            stats: worker.stats(),
            state: worker.subscribe(),
            grace_period: worker.shared.config.shutdown_grace_period,
            worker: Some(worker),
            handle: None,
        }
    }

    /// Spawns the loop onto the runtime and returns immediately.
    ///
    /// # Errors
    ///
    /// [`WorkerError::AlreadyRunning`] when called twice.
    pub fn start(&mut self) -> Result<()> {
        let mut worker = self.worker.take().ok_or(WorkerError::AlreadyRunning)?;
        self.handle = Some(tokio::spawn(async move { worker.run().await }));
        info!("worker engine started");
        Ok(())
    }

    /// Stops polling and waits up to the grace period for the current batch.
    ///
    /// # Errors
    ///
    /// [`WorkerError::ShutdownTimeout`] when the batch does not drain in
    /// time; the loop is aborted. [`WorkerError::TaskPanic`] when the loop
    /// panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        let grace_period = self.grace_period;
        info!(grace_period_secs = grace_period.as_secs(), "shutting down worker engine");
        self.cancellation.cancel();

        let Some(mut handle) = self.handle.take() else {
            info!("worker engine was not started, shutdown completed immediately");
            return Ok(());
        };

        match tokio::time::timeout(grace_period, &mut handle).await {
            Ok(Ok(result)) => {
                info!("worker engine shutdown completed");
                result
            },
            Ok(Err(join_error)) => {
                error!(error = %join_error, "worker loop panicked during shutdown");
                Err(WorkerError::task_panic("worker loop", join_error))
            },
            Err(_elapsed) => {
                handle.abort();
                let in_flight = self.stats.read().await.in_flight;
                error!(
                    timeout_seconds = grace_period.as_secs(),
                    in_flight,
                    "worker shutdown timed out, abandoning in-flight jobs"
                );
                Err(WorkerError::ShutdownTimeout { timeout: grace_period })
            },
        }
    }

    /// Snapshot of the statistics.
    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// Current loop state.
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Receiver following loop state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// True while the spawned loop is alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl fmt::Debug for WorkerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerEngine")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}

impl Drop for WorkerEngine {
    fn drop(&mut self) {
        if self.is_running() && !self.cancellation.is_cancelled() {
            error!("WorkerEngine dropped while running, cancelling the worker loop");
            self.cancellation.cancel();
            warn!("call shutdown() before dropping the engine so the current batch can drain");
        }
    }
}
