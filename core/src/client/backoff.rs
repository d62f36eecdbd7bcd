// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Shape of the backoff curve.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Hard ceiling on any single computed delay, before jitter.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub exponential_base: f64,
    /// Whether to apply the `[0.5, 1.5)` jitter factor. When `false`,
    /// [`jittered_delay`] returns the unjittered value unchanged — useful
    /// for deterministic tests.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

/// `min(max_delay, base_delay * exponential_base^(attempt-1))`, before
/// jitter. `attempt` is 1-based (the delay before the first retry uses
/// `attempt = 1`).
pub fn unjittered_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let exponent = (attempt.saturating_sub(1)) as i32;
    let scaled = config.exponential_base.powi(exponent) * config.initial_delay.as_secs_f64();
    let capped = scaled.min(config.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped.max(0.0))
}

/// The unjittered delay scaled by a uniform random factor in `[0.5, 1.5)`.
/// A no-op when `config.jitter` is `false`.
pub fn jittered_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let base = unjittered_delay(config, attempt);
    if !config.jitter {
        return base;
    }
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unjittered_delay_grows_exponentially() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter: true,
        };
        assert_eq!(unjittered_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(unjittered_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(unjittered_delay(&config, 3), Duration::from_millis(400));
    }

    #[test]
    fn unjittered_delay_respects_max() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            exponential_base: 2.0,
            jitter: true,
        };
        assert_eq!(unjittered_delay(&config, 5), Duration::from_millis(250));
    }

    #[test]
    fn jittered_delay_lies_in_expected_bounds() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter: true,
        };
        let base = unjittered_delay(&config, 2).as_secs_f64();
        for _ in 0..200 {
            let d = jittered_delay(&config, 2).as_secs_f64();
            assert!(d >= base * 0.5 - 1e-9, "{d} too small for base {base}");
            assert!(d < base * 1.5 + 1e-9, "{d} too large for base {base}");
        }
    }

    #[test]
    fn jitter_disabled_returns_unjittered_value() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(jittered_delay(&config, 2), unjittered_delay(&config, 2));
    }
}
