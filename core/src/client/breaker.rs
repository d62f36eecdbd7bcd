// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-host circuit breaker state machine: closed, open, half-open.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// The breaker's externally-visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls are short-circuited until the cooldown elapses.
    Open,
    /// Cooldown elapsed; the next call is a trial.
    HalfOpen,
}

struct HostBreaker {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Configuration shaping when a breaker opens and how long it stays open.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive retryable failures before a breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker stays open before a trial call.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// Per-host breaker state, guarded by a single mutex — breaker transitions
/// are rare and cheap, so a `parking_lot::Mutex` is sufficient.
pub struct CircuitBreaker {
    config: BreakerConfig,
    hosts: Mutex<HashMap<String, HostBreaker>>,
}

impl CircuitBreaker {
    /// Build a breaker with the given shape. Hosts are registered lazily on
    /// first use, starting `Closed`.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Current externally-visible state for `host`. Unknown hosts are
    /// `Closed`. Transitions an `Open` breaker to `HalfOpen` as a side
    /// effect if the cooldown has elapsed.
    pub fn state(&self, host: &str) -> BreakerState {
        let mut hosts = self.hosts.lock();
        let entry = hosts.entry(host.to_string()).or_insert(HostBreaker {
            state: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
        });
        if entry.state == BreakerState::Open {
            if let Some(opened_at) = entry.opened_at {
                if opened_at.elapsed() >= self.config.cooldown {
                    entry.state = BreakerState::HalfOpen;
                }
            }
        }
        entry.state
    }

    /// Whether a call to `host` should be attempted right now.
    pub fn allows_call(&self, host: &str) -> bool {
        !matches!(self.state(host), BreakerState::Open)
    }

    /// Record a successful call. A `HalfOpen` trial success resets to
    /// `Closed` and clears the failure count; a `Closed` success is a no-op
    /// other than clearing any stray failure count.
    pub fn record_success(&self, host: &str) -> bool {
        let mut hosts = self.hosts.lock();
        let entry = hosts.entry(host.to_string()).or_insert(HostBreaker {
            state: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
        });
        let was_half_open = entry.state == BreakerState::HalfOpen;
        entry.state = BreakerState::Closed;
        entry.failure_count = 0;
        entry.opened_at = None;
        was_half_open
    }

    /// Record a retryable failure. Returns `true` if this call just opened
    /// the breaker (only after `>= failure_threshold` consecutive failures).
    /// A failed `HalfOpen` trial re-opens immediately and resets
    /// `opened_at`.
    pub fn record_failure(&self, host: &str) -> bool {
        let mut hosts = self.hosts.lock();
        let entry = hosts.entry(host.to_string()).or_insert(HostBreaker {
            state: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
        });

        if entry.state == BreakerState::HalfOpen {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
            return true;
        }

        entry.failure_count += 1;
        if entry.failure_count >= self.config.failure_threshold && entry.state != BreakerState::Open {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
            return true;
        }
        false
    }

    /// Current consecutive failure count for a host, for observability.
    pub fn failure_count(&self, host: &str) -> u32 {
        self.hosts.lock().get(host).map(|h| h.failure_count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(20),
        }
    }

    #[test]
    fn starts_closed_and_allows_calls() {
        let breaker = CircuitBreaker::new(fast_config());
        assert_eq!(breaker.state("h"), BreakerState::Closed);
        assert!(breaker.allows_call("h"));
    }

    #[test]
    fn opens_only_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        assert!(!breaker.record_failure("h"));
        assert!(!breaker.record_failure("h"));
        assert!(breaker.record_failure("h"));
        assert_eq!(breaker.state("h"), BreakerState::Open);
        assert!(!breaker.allows_call("h"));
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(fast_config());
        breaker.record_failure("h");
        breaker.record_failure("h");
        breaker.record_success("h");
        assert_eq!(breaker.failure_count("h"), 0);
        assert!(!breaker.record_failure("h"));
    }

    #[test]
    fn half_open_after_cooldown_then_success_closes() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure("h");
        }
        assert_eq!(breaker.state("h"), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state("h"), BreakerState::HalfOpen);
        let reset = breaker.record_success("h");
        assert!(reset);
        assert_eq!(breaker.state("h"), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure("h");
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(breaker.state("h"), BreakerState::HalfOpen);
        breaker.record_failure("h");
        assert_eq!(breaker.state("h"), BreakerState::Open);
    }
}
