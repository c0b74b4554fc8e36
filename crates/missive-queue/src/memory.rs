//! In-process queue backend.
//!
//! Mirrors the SQS contract closely enough to exercise the worker loop end to
//! end: received messages are hidden until their visibility deadline, lapsed
//! receipts are rejected and the message reappears, requeued copies wait out
//! their delay. Time comes from the injected [`Clock`], so a [`TestClock`]
//! drives visibility and delays deterministically.
//!
//! Every operation is appended to a journal of [`QueueEvent`]s that tests use
//! to assert ordering and exactly-once disposition.
//!
//! [`TestClock`]: missive_core::TestClock

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use missive_core::{Clock, Job, JobEnvelope, JobId, QueueKind, ReceiptHandle};
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use crate::{DeadLetterRecord, QueueClient, QueueError, Result, DEFAULT_VISIBILITY_TIMEOUT};

/// One entry of the in-memory queue's operation journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A poll returned `count` messages.
    Polled {
        /// Queue polled
        queue: QueueKind,
        /// Messages returned
        count: usize,
    },
    /// A message was acked.
    Acked {
        /// Job the message carried
        job_id: JobId,
        /// Queue it came from
        queue: QueueKind,
    },
    /// A message was replaced by a delayed copy.
    Requeued {
        /// Job the message carried
        job_id: JobId,
        /// Attempt count of the copy
        attempt: u32,
        /// Delay before the copy is receivable
        delay: Duration,
    },
    /// A held message's visibility was pushed out.
    VisibilityExtended {
        /// Job the message carried
        job_id: JobId,
        /// Visibility granted from the time of the call
        extra: Duration,
    },
    /// A dead-letter record was written.
    DeadLettered {
        /// Job the record describes
        job_id: JobId,
    },
    /// An ack or requeue presented a lapsed receipt.
    ReceiptRejected {
        /// Queue of the receipt
        queue: QueueKind,
    },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
}

#[derive(Debug)]
struct InFlight {
    queue: QueueKind,
    job_id: JobId,
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: HashMap<QueueKind, VecDeque<StoredMessage>>,
    delayed: Vec<(Instant, QueueKind, StoredMessage)>,
    in_flight: HashMap<String, InFlight>,
    dead_letters: Vec<DeadLetterRecord>,
    journal: Vec<QueueEvent>,
}

impl State {
    fn ready_mut(&mut self, queue: QueueKind) -> &mut VecDeque<StoredMessage> {
        self.ready.entry(queue).or_default()
    }

    /// Moves due delayed messages and lapsed receipts back to their queues.
    fn promote(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(visible_at, _, _)| *visible_at <= now);
        self.delayed = pending;
        for (_, queue, message) in due {
            self.ready_mut(queue).push_back(message);
        }

        let lapsed: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, held)| held.visible_at <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in lapsed {
            if let Some(held) = self.in_flight.remove(&token) {
                self.ready_mut(held.queue).push_front(held.message);
            }
        }
    }

    /// Removes a live receipt, rejecting lapsed or unknown ones.
    fn take_receipt(&mut self, receipt: &ReceiptHandle, now: Instant) -> Result<InFlight> {
        match self.in_flight.get(receipt.token()) {
            Some(held) if held.visible_at > now => {},
            _ => {
                self.promote(now);
                self.journal.push(QueueEvent::ReceiptRejected { queue: receipt.queue() });
                return Err(QueueError::ReceiptExpired { queue: receipt.queue() });
            },
        }
        self.in_flight
            .remove(receipt.token())
            .ok_or(QueueError::ReceiptExpired { queue: receipt.queue() })
    }
}

/// Queue backend held entirely in process memory.
///
/// Cheap to clone; clones share the same queues.
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<State>>,
    arrivals: Arc<Notify>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    /// Creates an empty queue pair with the default visibility timeout.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_visibility_timeout(clock, DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// Creates an empty queue pair with a custom visibility timeout.
    pub fn with_visibility_timeout(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            arrivals: Arc::new(Notify::new()),
            clock,
            visibility_timeout,
        }
    }

    /// Publishes an envelope, as a producer would.
    pub async fn enqueue(&self, queue: QueueKind, envelope: &JobEnvelope) -> Result<()> {
        let body = envelope.to_json()?;
        self.enqueue_raw(queue, body).await;
        Ok(())
    }

    /// Publishes an arbitrary body, including ones that are not envelopes.
    pub async fn enqueue_raw(&self, queue: QueueKind, body: impl Into<String>) {
        let message = StoredMessage { message_id: Uuid::new_v4().to_string(), body: body.into() };
        self.state.lock().await.ready_mut(queue).push_back(message);
        self.arrivals.notify_waiters();
    }

    /// Messages currently receivable from `queue`.
    pub async fn ready_len(&self, queue: QueueKind) -> usize {
        let mut state = self.state.lock().await;
        state.promote(self.clock.now());
        state.ready_mut(queue).len()
    }

    /// Messages held under a live receipt.
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Delayed copies not yet receivable.
    pub async fn delayed_len(&self) -> usize {
        self.state.lock().await.delayed.len()
    }

    /// Dead-letter records written so far.
    pub async fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Full operation journal in order.
    pub async fn journal(&self) -> Vec<QueueEvent> {
        self.state.lock().await.journal.clone()
    }

    /// Job ids acked so far, in ack order.
    pub async fn acked(&self) -> Vec<JobId> {
        self.journal()
            .await
            .into_iter()
            .filter_map(|event| match event {
                QueueEvent::Acked { job_id, .. } => Some(job_id),
                _ => None,
            })
            .collect()
    }

    /// `(job id, attempt, delay)` of every requeue, in order.
    pub async fn requeued(&self) -> Vec<(JobId, u32, Duration)> {
        self.journal()
            .await
            .into_iter()
            .filter_map(|event| match event {
                QueueEvent::Requeued { job_id, attempt, delay } => Some((job_id, attempt, delay)),
                _ => None,
            })
            .collect()
    }

    async fn receive(&self, queue: QueueKind, max_messages: usize) -> Vec<Job> {
        let now = self.clock.now();
        let received_at = self.clock.now_utc();
        let mut state = self.state.lock().await;
        state.promote(now);

        let mut jobs = Vec::new();
        while jobs.len() < max_messages {
            let Some(message) = state.ready_mut(queue).pop_front() else {
                break;
            };
            let token = Uuid::new_v4().to_string();
            let receipt = ReceiptHandle::new(queue, token.clone());
            let job = Job::decode(&message.body, &message.message_id, receipt, received_at);
            state.in_flight.insert(
                token,
                InFlight {
                    queue,
                    job_id: job.id.clone(),
                    message,
                    visible_at: now + self.visibility_timeout,
                },
            );
            jobs.push(job);
        }
        state.journal.push(QueueEvent::Polled { queue, count: jobs.len() });
        jobs
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn poll_batch(
        &self,
        queue: QueueKind,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Job>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let arrived = self.arrivals.notified();
        let jobs = self.receive(queue, max_messages).await;
        if !jobs.is_empty() || wait_time.is_zero() {
            return Ok(jobs);
        }

        tokio::select! {
            () = arrived => {},
            () = self.clock.sleep(wait_time) => {},
        }
        Ok(self.receive(queue, max_messages).await)
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let held = state.take_receipt(receipt, now)?;
        state.journal.push(QueueEvent::Acked { job_id: held.job_id, queue: held.queue });
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &ReceiptHandle, extra: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        match state.in_flight.get_mut(receipt.token()) {
            Some(held) if held.visible_at > now => {
                held.visible_at = now + extra;
                let job_id = held.job_id.clone();
                state.journal.push(QueueEvent::VisibilityExtended { job_id, extra });
                Ok(())
            },
            _ => Err(QueueError::ReceiptExpired { queue: receipt.queue() }),
        }
    }

    async fn requeue(&self, job: &Job, next_attempt: u32, delay: Duration) -> Result<()> {
        let body = job.envelope_for_attempt(next_attempt).to_json()?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let held = state.take_receipt(&job.receipt, now)?;

        let copy = StoredMessage { message_id: held.message.message_id, body };
        if delay.is_zero() {
            state.ready_mut(held.queue).push_back(copy);
        } else {
            state.delayed.push((now + delay, held.queue, copy));
        }
        state.journal.push(QueueEvent::Requeued {
            job_id: job.id.clone(),
            attempt: next_attempt,
            delay,
        });
        drop(state);

        debug!(
            job_id = %job.id,
            attempt = next_attempt,
            delay_ms = delay.as_millis() as u64,
            "requeued in memory"
        );
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, record: &DeadLetterRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.journal.push(QueueEvent::DeadLettered { job_id: record.job_id.clone() });
        state.dead_letters.push(record.clone());
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
