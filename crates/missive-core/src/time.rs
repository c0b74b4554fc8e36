//! Clock abstraction for visibility deadlines, backoff and poll cadence.
//!
//! Production code runs on [`RealClock`]. Tests inject a [`TestClock`] whose
//! `sleep` advances virtual time instantly, so a worker loop that would spend
//! minutes backing off runs through its cycles in milliseconds.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

/// Source of time for everything that schedules or measures.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for deadlines and elapsed measurements.
    fn now(&self) -> Instant;

    /// Wall-clock time for records and logs.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// System time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock advanced explicitly or by sleeping.
///
/// Clones share the same offset, so a clone handed to a queue and one held
/// by the test observe the same time.
#[derive(Debug, Clone)]
pub struct TestClock {
    offset_ns: Arc<AtomicU64>,
    base_instant: Instant,
    base_utc: DateTime<Utc>,
}

impl TestClock {
    /// Creates a clock anchored at 2024-01-01T00:00:00Z.
    pub fn new() -> Self {
        let base_utc = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default();
        Self::starting_at(base_utc)
    }

    /// Creates a clock anchored at the given wall-clock time.
    pub fn starting_at(base_utc: DateTime<Utc>) -> Self {
        Self { offset_ns: Arc::new(AtomicU64::new(0)), base_instant: Instant::now(), base_utc }
    }

    /// Moves virtual time forward.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.base_utc + elapsed
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
