//! Exponential backoff for reconnects and retryable operations.

use std::time::{Duration, Instant};

/// Backoff parameters for session reconnects and retryable store/catalog
/// operations.
#[derive(Debug, Copy, Clone)]
pub struct RetryConfig {
    /// Attempts before a retryable operation is surfaced as unhealthy.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the exponential growth.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Randomize delays to avoid reconnect stampedes.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self)
    }
}

/// Delay sequence: `initial`, `initial * m`, ... capped at `max_delay`,
/// with optional ±30% jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    current_delay: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.multiplier,
            jitter: config.jitter,
            current_delay: config.initial_delay,
            attempt: 0,
        }
    }

    /// Returns the delay for this attempt and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;

        let next_ms = (self.current_delay.as_millis() as f64 * self.multiplier) as u64;
        self.current_delay = Duration::from_millis(next_ms).min(self.max_delay);
        self.attempt += 1;

        if self.jitter {
            jittered(delay)
        } else {
            delay
        }
    }

    /// Reset after a successful attempt so the next failure starts cheap.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ±30% spread seeded from the monotonic clock. Good enough to break up
// reconnect stampedes without pulling in a PRNG.
fn jittered(delay: Duration) -> Duration {
    let nanos = Instant::now().elapsed().subsec_nanos();
    let base = delay.as_millis() as f64;
    let unit = (nanos % 1000) as f64 / 1000.0;
    let adjustment = (unit - 0.5) * 2.0 * (base * 0.3);
    Duration::from_millis((base + adjustment).max(0.0) as u64)
}
