//! Errors surfaced by the worker engine.
//!
//! Per-job failures never show up here: they become a
//! [`ProcessingResult`](crate::ProcessingResult) and are applied to the
//! queue. These variants cover the loop's own plumbing and lifecycle.

use std::time::Duration;

use missive_queue::QueueError;
use thiserror::Error;

/// Result alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Worker lifecycle and plumbing failures.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A queue operation failed.
    #[error("queue operation failed: {0}")]
    Queue(#[from] QueueError),

    /// Settings are inconsistent or a backend could not be built.
    #[error("invalid worker configuration: {message}")]
    Configuration {
        /// What is wrong
        message: String,
    },

    /// In-flight work did not drain within the grace period.
    #[error("shutdown did not complete within {}s", timeout.as_secs())]
    ShutdownTimeout {
        /// Grace period that elapsed
        timeout: Duration,
    },

    /// A spawned task panicked.
    #[error("{task} task panicked: {error}")]
    TaskPanic {
        /// Which task
        task: String,
        /// Join error text
        error: String,
    },

    /// The engine was started twice.
    #[error("worker engine already running")]
    AlreadyRunning,
}

impl WorkerError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a task panic error.
    pub fn task_panic(task: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::TaskPanic { task: task.into(), error: error.to_string() }
    }
}
