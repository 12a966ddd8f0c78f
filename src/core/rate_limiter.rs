use crate::config::RetryConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Jittered exponential backoff for transient provider failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Single attempt, no waiting. Useful when the caller wants fail-fast behaviour.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (0-based), with up to 25% jitter either way.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16) as u32);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let millis = delay.as_millis() as u64;
        if millis < 4 {
            return delay;
        }
        let spread = millis / 4;
        let jittered = {
            let mut rng = rand::thread_rng();
            rng.gen_range(millis - spread..=millis + spread)
        };
        Duration::from_millis(jittered)
    }

    /// Run `op` until it succeeds or the attempt budget is spent, returning the last error.
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        return Err(err);
                    }
                    sleep(self.delay_for(attempt - 1)).await;
                }
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self::new(cfg.attempts, cfg.base_delay, cfg.max_delay)
    }
}
