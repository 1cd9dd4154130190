// ===============================
// src/retry.rs
// ===============================
use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff: base * 2^attempt, capped, plus up to 25% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 5, base: Duration::from_millis(50), cap: Duration::from_secs(5) }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let factor = 1u32 << shift;
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let d = self.base_delay(attempt);
        let jitter_ms = (d.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 { rand::thread_rng().gen_range(0..=jitter_ms) } else { 0 };
        (d + Duration::from_millis(jitter)).min(self.cap)
    }

    pub fn exhausted(&self, attempt: u32) -> bool { attempt > self.max_retries }
}
