//! Counters shared by the processor and the worker loop.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

/// Shared, lock-guarded statistics handle.
pub type SharedStats = Arc<RwLock<WorkerStats>>;

/// Worker statistics since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Completed poll cycles.
    pub cycles: u64,
    /// Non-empty batches read from the priority queue.
    pub priority_batches: u64,
    /// Non-empty batches read from the regular queue.
    pub regular_batches: u64,
    /// Jobs run through the processor.
    pub jobs_processed: u64,
    /// Jobs the provider accepted.
    pub delivered: u64,
    /// Jobs skipped because their id was already delivered.
    pub duplicates: u64,
    /// Messages removed from their queue after success.
    pub acked: u64,
    /// Jobs published again for a later attempt.
    pub requeued: u64,
    /// Jobs given up on.
    pub dead_lettered: u64,
    /// Acks or requeues refused because the receipt had lapsed.
    pub receipt_expired: u64,
    /// Failed polls.
    pub poll_errors: u64,
    /// Failed acks, requeues, dead-letter writes and extensions.
    pub queue_errors: u64,
    /// Jobs currently being processed.
    pub in_flight: u64,
}

/// Creates an empty shared statistics handle.
pub fn shared() -> SharedStats {
    Arc::new(RwLock::new(WorkerStats::default()))
}
