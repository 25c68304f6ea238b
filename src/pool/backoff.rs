use std::time::Duration;

use rand::Rng;

use crate::config;

/// Exponential backoff with optional symmetric jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter: f64,
}

impl From<&config::Backoff> for Backoff {
    fn from(value: &config::Backoff) -> Self {
        Self {
            initial_ms: value.initial_ms,
            max_ms: value.max_ms,
            multiplier: value.multiplier,
            jitter: value.jitter,
        }
    }
}

impl Backoff {
    /// Delay before the retry following `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let pow = self.multiplier.powi(attempt as i32);
        let delay_ms = ((self.initial_ms as f64 * pow) as u64).min(self.max_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 && delay_ms > 0 {
            let scale: f64 = rand::thread_rng().gen_range(-jitter..=jitter);
            let adjusted = (delay_ms as f64 * (1.0 + scale)).round().max(0.0) as u64;
            return Duration::from_millis(adjusted);
        }

        Duration::from_millis(delay_ms)
    }
}
