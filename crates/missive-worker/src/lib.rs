//! Notification job processing with bounded retries and queue priority.
//!
//! This crate turns queue messages into delivered email. A single
//! [`WorkerLoop`] polls the priority queue ahead of the regular queue, hands
//! each job to the [`JobProcessor`] and applies the resulting
//! [`ProcessingResult`] back to the queue.
//!
//! # Pipeline
//!
//! 1. **Route** - the job type selects a [`JobHandler`]
//! 2. **Validate** - the handler builds an [`EmailMessage`]; bad payloads
//!    are dead-lettered without contacting the provider
//! 3. **Dedupe** - the [`DeliveryLedger`] skips ids already delivered
//! 4. **Send** - the configured [`EmailDispatcher`] classifies the outcome
//! 5. **Decide** - the [`RetryPolicy`] maps attempt and outcome to ack,
//!    retry or dead letter
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use missive_core::RealClock;
//! use missive_queue::InMemoryQueue;
//! use missive_worker::{
//!     HandlerRegistry, InMemoryLedger, JobProcessor, LoopConfig, RetryPolicy, WorkerEngine,
//!     WorkerLoop,
//! };
//! # use missive_mail::ScriptedDispatcher;
//!
//! # async fn example() -> missive_worker::Result<()> {
//! let clock = Arc::new(RealClock::new());
//! let queue = Arc::new(InMemoryQueue::new(clock.clone()));
//! let ledger = InMemoryLedger::new(
//!     clock.clone(),
//!     std::time::Duration::from_secs(86_400),
//!     std::time::Duration::from_secs(30),
//! );
//! let processor = JobProcessor::new(
//!     HandlerRegistry::with_builtin("office@school.example"),
//!     Arc::new(ScriptedDispatcher::succeeding()),
//!     Arc::new(ledger),
//!     RetryPolicy::default(),
//! );
//!
//! let worker = WorkerLoop::new(queue, processor, LoopConfig::default(), clock);
//! let mut engine = WorkerEngine::new(worker);
//! engine.start()?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`EmailMessage`]: missive_mail::EmailMessage
//! [`EmailDispatcher`]: missive_mail::EmailDispatcher

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dedupe;
pub mod engine;
pub mod error;
pub mod handler;
pub mod processor;
pub mod retry;
pub mod stats;

pub use config::{DedupeProvider, EmailProvider, LogFormat, QueueProvider, WorkerConfig};
pub use dedupe::{Claim, DeliveryLedger, InMemoryLedger, RedisLedger};
pub use engine::{CycleOutcome, LoopConfig, LoopState, WorkerEngine, WorkerLoop};
pub use error::{Result, WorkerError};
pub use handler::{HandlerRegistry, JobHandler, SendDigestHandler, SendEmailHandler};
pub use processor::{JobProcessor, ProcessingResult};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use stats::{SharedStats, WorkerStats};
