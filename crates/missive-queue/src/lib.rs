//! Queue client abstraction for the missive worker.
//!
//! The worker loop talks to exactly one [`QueueClient`] and never learns
//! which backend sits behind it. Three backends implement the trait:
//!
//! - [`sqs::SqsQueue`]: two managed SQS queues (priority and regular) with an
//!   optional dead-letter queue
//! - [`redis_list::RedisQueue`]: list-based store with visibility and delay
//!   emulated through sorted sets
//! - [`memory::InMemoryQueue`]: in-process store driven by a [`Clock`], used
//!   by tests and local runs
//!
//! All backends deliver at least once. A message that is not acked, requeued
//! or extended before its visibility timeout lapses becomes receivable again,
//! possibly by another worker.
//!
//! [`Clock`]: missive_core::Clock

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use missive_core::{Job, JobId, QueueKind, ReceiptHandle};
use serde::{Deserialize, Serialize};

pub mod error;
pub mod memory;
pub mod redis_list;
pub mod sqs;

pub use error::{QueueError, Result};
pub use memory::{InMemoryQueue, QueueEvent};
pub use redis_list::RedisQueue;
pub use sqs::{SqsQueue, SqsQueueConfig};

/// SQS rejects receive batches larger than this.
pub const MAX_BATCH_SIZE: usize = 10;

/// Longest long-poll SQS accepts.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// Longest message delay SQS accepts.
pub const MAX_DELAY: Duration = Duration::from_secs(900);

/// Default time a received message stays hidden from other consumers.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Uniform pull/ack interface over every queue backend.
///
/// A receipt handle is consumed by exactly one of [`ack`](Self::ack) or
/// [`requeue`](Self::requeue). [`dead_letter`](Self::dead_letter) only writes
/// the record; the caller acks the original afterwards.
#[async_trait]
pub trait QueueClient: Send + Sync + std::fmt::Debug {
    /// Receives up to `max_messages` jobs from `queue`.
    ///
    /// Waits up to `wait_time` for the first message. Returns an empty batch
    /// when nothing arrived; "no messages" is never an error.
    async fn poll_batch(
        &self,
        queue: QueueKind,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Job>>;

    /// Permanently removes a received message.
    ///
    /// Fails with [`QueueError::ReceiptExpired`] once the visibility timeout
    /// has lapsed; the message may then be redelivered elsewhere.
    async fn ack(&self, receipt: &ReceiptHandle) -> Result<()>;

    /// Keeps a received message hidden for `extra` from now.
    async fn extend_visibility(&self, receipt: &ReceiptHandle, extra: Duration) -> Result<()>;

    /// Publishes a copy of `job` with `next_attempt` that becomes receivable
    /// after `delay`, then removes the original message.
    async fn requeue(&self, job: &Job, next_attempt: u32, delay: Duration) -> Result<()>;

    /// Records a job that will not be retried.
    async fn dead_letter(&self, record: &DeadLetterRecord) -> Result<()>;

    /// Backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Terminal record written for every dead-lettered job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Logical task identifier.
    pub job_id: JobId,
    /// Job type as received.
    pub job_type: String,
    /// Queue the job was read from.
    pub queue: QueueKind,
    /// Attempt count at the time of the final failure.
    pub attempt: u32,
    /// Why the job was given up on.
    pub reason: String,
    /// Original payload for manual replay.
    pub payload: serde_json::Value,
    /// When the record was written.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Builds the record for `job`.
    pub fn new(job: &Job, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.to_string(),
            queue: job.priority(),
            attempt: job.attempt,
            reason: reason.into(),
            payload: job.payload.clone(),
            dead_lettered_at: at,
        }
    }
}
