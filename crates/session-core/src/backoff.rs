//! Exponential backoff with jitter for the reconnect loop: delays grow
//! from a base, cap at a ceiling, and reset to base on any successful
//! `connected`. There is no retry-count ceiling, only a capped delay,
//! since the reconnect loop runs forever until `close()`.

use std::time::Duration;

/// Backoff parameters. Defaults chosen to match common ecosystem presets
/// (base 250ms, doubling, capped at 30s).
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any single delay, pre-jitter.
    pub max: Duration,
    /// Jitter fraction applied symmetrically (`0.25` == ±25%).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

/// Tracks the current attempt count for one backoff sequence. Reset to
/// base on any successful `connected`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// A fresh backoff at attempt zero.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// The delay before the next retry, advancing the internal attempt
    /// counter. Exponential growth from `base`, capped at `max`, then
    /// jittered by ±`jitter` fraction.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let exp = self.attempt.min(20);
        let unjittered = self
            .config
            .base
            .saturating_mul(1u32.checked_shl(exp.saturating_sub(1)).unwrap_or(u32::MAX));
        let capped = unjittered.min(self.config.max);

        let jitter_range = capped.as_secs_f64() * self.config.jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let jittered_secs = (capped.as_secs_f64() + jitter).max(0.0);
        Duration::from_secs_f64(jittered_secs)
    }

    /// Reset to the initial state, on any successful `connected`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// How many delays have been handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let config = BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
            jitter: 0.0,
        };
        let mut backoff = Backoff::new(config);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn reset_returns_to_base() {
        let config = BackoffConfig {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
            jitter: 0.0,
        };
        let mut backoff = Backoff::new(config);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
