//! Core domain types for the missive notification worker.
//!
//! Defines the job model shared by every other crate: the wire envelope
//! producers publish, the decoded [`Job`] a worker holds while a receipt is
//! live, the [`DeliveryOutcome`] taxonomy mail adapters report, and the
//! [`Clock`] abstraction that keeps visibility and backoff timing testable.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod job;
pub mod outcome;
pub mod time;

pub use error::ValidationError;
pub use job::{Job, JobEnvelope, JobId, JobType, QueueKind, ReceiptHandle};
pub use outcome::DeliveryOutcome;
pub use time::{Clock, RealClock, TestClock};
