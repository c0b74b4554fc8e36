//! Scripted dispatcher for tests and dry runs.
//!
//! Plays back a queue of outcomes, one per `send`, then falls back to a
//! default. Every message handed to it is recorded so tests can count
//! provider calls and inspect what would have gone out.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use missive_core::DeliveryOutcome;
use tokio::sync::Mutex;

use crate::{EmailDispatcher, EmailMessage};

#[derive(Debug)]
struct Script {
    outcomes: VecDeque<DeliveryOutcome>,
    fallback: DeliveryOutcome,
    sent: Vec<EmailMessage>,
}

/// Dispatcher that returns pre-programmed outcomes.
///
/// Clones share the same script and call log.
#[derive(Debug, Clone)]
pub struct ScriptedDispatcher {
    script: Arc<Mutex<Script>>,
    latency: Duration,
}

impl ScriptedDispatcher {
    /// Succeeds on every call.
    pub fn succeeding() -> Self {
        Self::with_fallback(DeliveryOutcome::Success)
    }

    /// Returns `fallback` on every call.
    pub fn with_fallback(fallback: DeliveryOutcome) -> Self {
        Self::scripted(VecDeque::new(), fallback)
    }

    /// Plays `outcomes` in order, then succeeds.
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = DeliveryOutcome>) -> Self {
        Self::scripted(outcomes.into_iter().collect(), DeliveryOutcome::Success)
    }

    fn scripted(outcomes: VecDeque<DeliveryOutcome>, fallback: DeliveryOutcome) -> Self {
        let script = Script { outcomes, fallback, sent: Vec::new() };
        Self { script: Arc::new(Mutex::new(script)), latency: Duration::ZERO }
    }

    /// Waits `latency` on every call before answering.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Appends an outcome to the script.
    pub async fn push(&self, outcome: DeliveryOutcome) {
        self.script.lock().await.outcomes.push_back(outcome);
    }

    /// Messages received so far, in call order.
    pub async fn sent(&self) -> Vec<EmailMessage> {
        self.script.lock().await.sent.clone()
    }

    /// Number of `send` calls so far.
    pub async fn call_count(&self) -> usize {
        self.script.lock().await.sent.len()
    }
}

#[async_trait]
impl EmailDispatcher for ScriptedDispatcher {
    async fn send(&self, message: &EmailMessage) -> DeliveryOutcome {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut script = self.script.lock().await;
        script.sent.push(message.clone());
        match script.outcomes.pop_front() {
            Some(outcome) => outcome,
            None => script.fallback.clone(),
        }
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}
