//! Redis list backend.
//!
//! Producers `LPUSH` envelope JSON onto `{prefix}:priority` or
//! `{prefix}:regular`; the worker pops from the other end, so each list is
//! FIFO. Redis lists have no visibility timeout, so receipts are emulated:
//!
//! - `{prefix}:inflight` sorted set, receipt token scored by visibility
//!   deadline in epoch milliseconds
//! - `{prefix}:receipts` hash, receipt token to the held message
//! - `{prefix}:delayed` sorted set, requeued copies scored by due time
//! - `{prefix}:dead` list of dead-letter records
//!
//! Every move between these keys runs as one Lua script, so a message is
//! always in exactly one of them even when the connection drops mid-call.
//! Lapsed receipts and due copies are moved back onto their lists at the
//! start of every poll.
//!
//! Long polls wait with `BLMOVE list list RIGHT RIGHT`, which blocks until
//! the list has an element and puts it straight back. The claim script then
//! takes it like any other message.

use std::{sync::Arc, time::Duration};

use ::redis::{aio::ConnectionManager, AsyncCommands, Client, Direction, Script};
use async_trait::async_trait;
use missive_core::{Clock, Job, JobEnvelope, QueueKind, ReceiptHandle};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{DeadLetterRecord, QueueClient, QueueError, Result};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "missive";

/// Pops up to `ARGV[1]` bodies and registers each under a receipt token.
///
/// KEYS: list, receipts, inflight. ARGV: max, deadline, queue, tokens...
const CLAIM_SCRIPT: &str = r"
local claimed = {}
for i = 1, tonumber(ARGV[1]) do
  local body = redis.call('RPOP', KEYS[1])
  if not body then break end
  local token = ARGV[3 + i]
  redis.call('HSET', KEYS[2], token, cjson.encode({ queue = ARGV[3], body = body }))
  redis.call('ZADD', KEYS[3], ARGV[2], token)
  table.insert(claimed, token)
  table.insert(claimed, body)
end
return claimed
";

/// Returns due delayed copies and lapsed receipts to their lists.
///
/// KEYS: delayed, inflight, receipts, priority list, regular list. ARGV: now.
const PROMOTE_SCRIPT: &str = r"
local lists = { priority = KEYS[4], regular = KEYS[5] }
local moved = 0
for _, member in ipairs(redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])) do
  redis.call('ZREM', KEYS[1], member)
  local ok, entry = pcall(cjson.decode, member)
  if ok and type(entry) == 'table' and lists[entry.queue] then
    redis.call('LPUSH', lists[entry.queue], entry.body)
    moved = moved + 1
  end
end
for _, token in ipairs(redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])) do
  redis.call('ZREM', KEYS[2], token)
  local held = redis.call('HGET', KEYS[3], token)
  redis.call('HDEL', KEYS[3], token)
  if held then
    local ok, entry = pcall(cjson.decode, held)
    if ok and type(entry) == 'table' and lists[entry.queue] then
      redis.call('RPUSH', lists[entry.queue], entry.body)
      moved = moved + 1
    end
  end
end
return moved
";

/// Deletes a receipt. Returns 0 when it was already gone.
///
/// KEYS: inflight, receipts. ARGV: token.
const RELEASE_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HDEL', KEYS[2], ARGV[1])
return 1
";

/// Writes the delayed copy, then deletes the receipt.
///
/// KEYS: inflight, receipts, delayed. ARGV: token, due, member.
const REQUEUE_SCRIPT: &str = r"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then return 0 end
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[3])
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
return 1
";

/// Pushes a live receipt's deadline out. Returns 0 when it lapsed.
///
/// KEYS: inflight. ARGV: token, now, new deadline.
const EXTEND_SCRIPT: &str = r"
local deadline = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not deadline or tonumber(deadline) <= tonumber(ARGV[2]) then return 0 end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[1])
return 1
";

/// Key names under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Keys {
    priority: String,
    regular: String,
    inflight: String,
    receipts: String,
    delayed: String,
    dead: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            priority: format!("{prefix}:{}", QueueKind::Priority),
            regular: format!("{prefix}:{}", QueueKind::Regular),
            inflight: format!("{prefix}:inflight"),
            receipts: format!("{prefix}:receipts"),
            delayed: format!("{prefix}:delayed"),
            dead: format!("{prefix}:dead"),
        }
    }

    fn list(&self, queue: QueueKind) -> &str {
        match queue {
            QueueKind::Priority => &self.priority,
            QueueKind::Regular => &self.regular,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DelayedMessage {
    queue: QueueKind,
    nonce: String,
    body: String,
}

#[derive(Debug, Clone)]
struct Scripts {
    claim: Script,
    promote: Script,
    release: Script,
    requeue: Script,
    extend: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            claim: Script::new(CLAIM_SCRIPT),
            promote: Script::new(PROMOTE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            requeue: Script::new(REQUEUE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        }
    }
}

/// Queue backend over Redis lists.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    blocking: ConnectionManager,
    keys: Arc<Keys>,
    scripts: Arc<Scripts>,
    visibility_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("keys", &self.keys)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    /// Connects to `url` and prepares a queue pair under `prefix`.
    ///
    /// Opens two managed connections: one for short commands and one for
    /// `BLMOVE`, which would otherwise stall every command multiplexed
    /// behind it. Both reconnect on their own after a Redis restart.
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        visibility_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Client::open(url).map_err(|e| QueueError::configuration(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let blocking = ConnectionManager::new(client).await?;
        let prefix = prefix.into();

        info!(prefix = %prefix, "connected to redis queue");
        Ok(Self {
            conn,
            blocking,
            keys: Arc::new(Keys::new(&prefix)),
            scripts: Arc::new(Scripts::load()),
            visibility_timeout,
            clock,
        })
    }

    fn now_ms(&self) -> i64 {
        self.clock.now_utc().timestamp_millis()
    }

    fn deadline_ms(&self, after: Duration) -> i64 {
        self.now_ms().saturating_add(i64::try_from(after.as_millis()).unwrap_or(i64::MAX))
    }

    /// Publishes an envelope, as a producer would.
    pub async fn enqueue(&self, queue: QueueKind, envelope: &JobEnvelope) -> Result<()> {
        let body = envelope.to_json()?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(self.keys.list(queue), body).await?;
        Ok(())
    }

    /// Moves due delayed copies and lapsed receipts back onto their lists.
    async fn promote(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .promote
            .key(&self.keys.delayed)
            .key(&self.keys.inflight)
            .key(&self.keys.receipts)
            .key(&self.keys.priority)
            .key(&self.keys.regular)
            .arg(self.now_ms())
            .invoke_async(&mut conn)
            .await?;
        if moved > 0 {
            debug!(moved, "returned delayed and lapsed messages to their lists");
        }
        Ok(())
    }

    /// Atomically pops up to `max_messages` bodies and registers receipts.
    async fn claim(&self, queue: QueueKind, max_messages: usize) -> Result<Vec<(String, String)>> {
        let mut invocation = self.scripts.claim.prepare_invoke();
        invocation
            .key(self.keys.list(queue))
            .key(&self.keys.receipts)
            .key(&self.keys.inflight)
            .arg(max_messages)
            .arg(self.deadline_ms(self.visibility_timeout))
            .arg(queue.as_str());
        for _ in 0..max_messages {
            invocation.arg(Uuid::new_v4().to_string());
        }

        let mut conn = self.conn.clone();
        let flat: Vec<String> = invocation.invoke_async(&mut conn).await?;
        let mut claimed = Vec::with_capacity(flat.len() / 2);
        let mut fields = flat.into_iter();
        while let (Some(token), Some(body)) = (fields.next(), fields.next()) {
            claimed.push((token, body));
        }
        Ok(claimed)
    }

    /// Blocks up to `wait_time` until `queue` has a message, leaving it in
    /// place. Returns false on timeout.
    async fn wait_for_message(&self, queue: QueueKind, wait_time: Duration) -> Result<bool> {
        let list = self.keys.list(queue);
        let mut blocking = self.blocking.clone();
        let moved: Option<String> = blocking
            .blmove(list, list, Direction::Right, Direction::Right, wait_time.as_secs_f64())
            .await?;
        Ok(moved.is_some())
    }

    /// Deletes a live receipt.
    async fn release(&self, receipt: &ReceiptHandle) -> Result<()> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .scripts
            .release
            .key(&self.keys.inflight)
            .key(&self.keys.receipts)
            .arg(receipt.token())
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            return Err(QueueError::ReceiptExpired { queue: receipt.queue() });
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for RedisQueue {
    async fn poll_batch(
        &self,
        queue: QueueKind,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<Job>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        self.promote().await?;

        let mut claimed = self.claim(queue, max_messages).await?;
        if claimed.is_empty()
            && wait_time >= Duration::from_secs(1)
            && self.wait_for_message(queue, wait_time).await?
        {
            claimed = self.claim(queue, max_messages).await?;
        }

        let received_at = self.clock.now_utc();
        let jobs: Vec<Job> = claimed
            .into_iter()
            .map(|(token, body)| {
                let receipt = ReceiptHandle::new(queue, token.clone());
                Job::decode(&body, &token, receipt, received_at)
            })
            .collect();

        debug!(queue = %queue, count = jobs.len(), "polled redis queue");
        Ok(jobs)
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> Result<()> {
        self.release(receipt).await
    }

    async fn extend_visibility(&self, receipt: &ReceiptHandle, extra: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .scripts
            .extend
            .key(&self.keys.inflight)
            .arg(receipt.token())
            .arg(self.now_ms())
            .arg(self.deadline_ms(extra))
            .invoke_async(&mut conn)
            .await?;
        if extended == 0 {
            return Err(QueueError::ReceiptExpired { queue: receipt.queue() });
        }
        Ok(())
    }

    async fn requeue(&self, job: &Job, next_attempt: u32, delay: Duration) -> Result<()> {
        let member = serde_json::to_string(&DelayedMessage {
            queue: job.receipt.queue(),
            nonce: Uuid::new_v4().to_string(),
            body: job.envelope_for_attempt(next_attempt).to_json()?,
        })?;

        let mut conn = self.conn.clone();
        let requeued: i64 = self
            .scripts
            .requeue
            .key(&self.keys.inflight)
            .key(&self.keys.receipts)
            .key(&self.keys.delayed)
            .arg(job.receipt.token())
            .arg(self.deadline_ms(delay))
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        if requeued == 0 {
            return Err(QueueError::ReceiptExpired { queue: job.receipt.queue() });
        }
        Ok(())
    }

    async fn dead_letter(&self, record: &DeadLetterRecord) -> Result<()> {
        let entry = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.keys.dead, entry).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
