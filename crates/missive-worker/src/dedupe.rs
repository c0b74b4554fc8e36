//! Idempotency ledger keyed by job id.
//!
//! Queues deliver at least once, so the same job can arrive twice: a lapsed
//! visibility timeout, a producer retry, or a requeue racing an ack. The
//! ledger remembers which ids were delivered and which are being worked on
//! so a duplicate never reaches the provider a second time.
//!
//! Lifecycle per id: [`begin`](DeliveryLedger::begin) claims it,
//! [`mark_delivered`](DeliveryLedger::mark_delivered) records success and
//! [`release`](DeliveryLedger::release) drops the claim after a failure so a
//! retry may claim it again.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use ::redis::{aio::ConnectionManager, AsyncCommands, Client};
use async_trait::async_trait;
use missive_core::{Clock, JobId};
use missive_queue::{QueueError, Result};
use tokio::sync::Mutex;
use tracing::info;

/// Result of claiming a job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Never seen, or forgotten after its TTL. The caller owns it now.
    Fresh,
    /// Delivered before; skip the provider.
    AlreadyDelivered,
    /// Another worker holds the claim right now.
    InFlight,
}

/// Remembers delivered job ids.
#[async_trait]
pub trait DeliveryLedger: Send + Sync + std::fmt::Debug {
    /// Claims `id` for delivery.
    async fn begin(&self, id: &JobId) -> Result<Claim>;

    /// Records a successful delivery of `id`.
    async fn mark_delivered(&self, id: &JobId) -> Result<()>;

    /// Drops the claim on `id` after a failed attempt.
    async fn release(&self, id: &JobId) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    InFlight,
    Delivered,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: EntryState,
    expires_at: Instant,
}

/// Process-local ledger with expiring entries.
///
/// Claims expire after `claim_ttl` so a job abandoned mid-flight can be
/// claimed again once its message is redelivered.
#[derive(Debug, Clone)]
pub struct InMemoryLedger {
    entries: Arc<Mutex<HashMap<JobId, Entry>>>,
    clock: Arc<dyn Clock>,
    delivered_ttl: Duration,
    claim_ttl: Duration,
}

impl InMemoryLedger {
    /// Creates a ledger remembering deliveries for `delivered_ttl`.
    pub fn new(clock: Arc<dyn Clock>, delivered_ttl: Duration, claim_ttl: Duration) -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), clock, delivered_ttl, claim_ttl }
    }

    /// Live entries, for tests and diagnostics.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.lock().await.values().filter(|entry| entry.expires_at > now).count()
    }

    /// True when no live entry exists.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DeliveryLedger for InMemoryLedger {
    async fn begin(&self, id: &JobId) -> Result<Claim> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);

        let claim = match entries.get(id).map(|entry| entry.state) {
            Some(EntryState::Delivered) => Claim::AlreadyDelivered,
            Some(EntryState::InFlight) => Claim::InFlight,
            None => {
                let expires_at = now + self.claim_ttl;
                entries.insert(id.clone(), Entry { state: EntryState::InFlight, expires_at });
                Claim::Fresh
            },
        };
        Ok(claim)
    }

    async fn mark_delivered(&self, id: &JobId) -> Result<()> {
        let expires_at = self.clock.now() + self.delivered_ttl;
        self.entries
            .lock()
            .await
            .insert(id.clone(), Entry { state: EntryState::Delivered, expires_at });
        Ok(())
    }

    async fn release(&self, id: &JobId) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.get(id).is_some_and(|entry| entry.state == EntryState::InFlight) {
            entries.remove(id);
        }
        Ok(())
    }
}

const IN_FLIGHT: &str = "in_flight";
const DELIVERED: &str = "delivered";

/// Ledger shared by every worker through Redis.
///
/// One string key per job id, `{prefix}:dedupe:{id}`, written with
/// `SET NX EX` so exactly one worker wins the claim.
#[derive(Clone)]
pub struct RedisLedger {
    conn: ConnectionManager,
    prefix: String,
    delivered_ttl: Duration,
    claim_ttl: Duration,
}

impl std::fmt::Debug for RedisLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLedger")
            .field("prefix", &self.prefix)
            .field("delivered_ttl", &self.delivered_ttl)
            .finish_non_exhaustive()
    }
}

impl RedisLedger {
    /// Connects to `url`.
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        delivered_ttl: Duration,
        claim_ttl: Duration,
    ) -> Result<Self> {
        let client = Client::open(url).map_err(|e| QueueError::configuration(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        let prefix = prefix.into();

        info!(prefix = %prefix, "connected to redis delivery ledger");
        Ok(Self { conn, prefix, delivered_ttl, claim_ttl })
    }

    fn key(&self, id: &JobId) -> String {
        format!("{}:dedupe:{}", self.prefix, id)
    }
}

/// Whole seconds for `EX`, at least one.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl DeliveryLedger for RedisLedger {
    async fn begin(&self, id: &JobId) -> Result<Claim> {
        let mut conn = self.conn.clone();
        let key = self.key(id);

        let claimed: Option<String> = ::redis::cmd("SET")
            .arg(&key)
            .arg(IN_FLIGHT)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs(self.claim_ttl))
            .query_async(&mut conn)
            .await?;
        if claimed.is_some() {
            return Ok(Claim::Fresh);
        }

        let state: Option<String> = conn.get(&key).await?;
        Ok(match state.as_deref() {
            Some(DELIVERED) => Claim::AlreadyDelivered,
            Some(_) => Claim::InFlight,
            // Expired between the two commands; the next redelivery claims it.
            None => Claim::InFlight,
        })
    }

    async fn mark_delivered(&self, id: &JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        let () = ::redis::cmd("SET")
            .arg(self.key(id))
            .arg(DELIVERED)
            .arg("EX")
            .arg(ttl_secs(self.delivered_ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&self, id: &JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.key(id);
        let state: Option<String> = conn.get(&key).await?;
        if state.as_deref() == Some(IN_FLIGHT) {
            conn.del::<_, ()>(&key).await?;
        }
        Ok(())
    }
}
