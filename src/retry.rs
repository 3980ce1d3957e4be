//! Bounded retry around a [`ModelClient`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::brain::ModelClient;
use crate::conversation::Conversation;
use crate::error::ModelError;
use crate::types::ModelTurn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// A server-suggested delay wins over the computed backoff.
    pub fn delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Retries rate-limit class errors; everything else propagates at once.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
    sleep: Sleeper,
}

impl<C: ModelClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            sleep: Arc::new(std::thread::sleep),
        }
    }

    /// Replace the blocking sleep, used to observe delays in tests.
    pub fn with_sleeper(mut self, sleep: Sleeper) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: ModelClient> ModelClient for RetryingClient<C> {
    fn generate(&self, conversation: &Conversation) -> Result<ModelTurn, ModelError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.generate(conversation) {
                Ok(turn) => {
                    if attempt > 1 {
                        info!(attempt, "model call succeeded after retry");
                    }
                    return Ok(turn);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self.policy.delay(attempt, e.suggested_delay());
                    warn!(
                        attempt,
                        max_attempts,
                        kind = e.kind(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "model call failed, retrying"
                    );
                    (self.sleep)(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
