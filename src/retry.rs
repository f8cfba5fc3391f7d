use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::AppResult;

const MAX_EXPONENT: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Linear,
    Exponential,
    ExponentialJitter,
}

impl Backoff {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "linear" => Some(Backoff::Linear),
            "exponential" => Some(Backoff::Exponential),
            "exponential_jitter" | "jitter" => Some(Backoff::ExponentialJitter),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backoff::Linear => "linear",
            Backoff::Exponential => "exponential",
            Backoff::ExponentialJitter => "exponential_jitter",
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff: Backoff,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff: Backoff::Linear,
            jitter_rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rng(self, rng: StdRng) -> Self {
        Self {
            jitter_rng: Arc::new(Mutex::new(rng)),
            ..self
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Pause taken after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt),
            Backoff::Exponential => self.exponential(attempt),
            Backoff::ExponentialJitter => {
                let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
                let jitter_ms = if base_ms == 0 {
                    0
                } else {
                    self.jitter_rng.lock().gen_range(0..base_ms)
                };
                self.exponential(attempt)
                    .saturating_add(Duration::from_millis(jitter_ms))
            }
        }
    }

    fn exponential(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(MAX_EXPONENT);
        self.base_delay.saturating_mul(1 << exponent)
    }

    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(target: "retry", label, attempt, "operation recovered");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        target: "retry",
                        ?err,
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        "operation failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(target: "retry", ?err, label, attempt, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}
