// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration data structures for the Yggdrasil dispatcher.
//!
//! Covers per-host concurrency limits, retry/breaker shape, the configured
//! host fleet, observability wiring, loop timing, and cloud fallback.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_valid::Validate;

/// Root configuration structure for the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Per-host semaphore size, keyed by host name (1-16).
    pub concurrency: HashMap<String, u32>,

    /// Backoff shape shared by every retry/breaker client call.
    #[validate]
    pub retry: RetryOptions,

    /// Circuit breaker shape shared by every host.
    #[validate]
    pub breaker: BreakerOptions,

    /// The configured executor/LLM host fleet.
    #[validate]
    pub hosts: Vec<HostConfig>,

    /// Telemetry wiring.
    #[validate]
    pub observability: ObservabilityConfig,

    /// Seconds between ready-queue polls (default 2, async mode).
    #[validate(minimum = 1)]
    pub poll_interval_seconds: u64,

    /// Seconds to wait for in-flight tasks to finish during shutdown.
    #[validate(minimum = 1)]
    pub shutdown_timeout_seconds: u64,

    /// Seconds between background health probes of each configured host.
    #[validate(minimum = 1)]
    pub health_check_interval_seconds: u64,

    /// Cloud fallback wiring.
    #[validate]
    pub cloud: CloudOptions,

    /// The host to route to when no configured host advertises a matching
    /// (or `general`) capability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_host: Option<String>,

    /// Path to the `rusqlite` ledger database file.
    pub ledger_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: HashMap::new(),
            retry: RetryOptions::default(),
            breaker: BreakerOptions::default(),
            hosts: Vec::new(),
            observability: ObservabilityConfig::default(),
            poll_interval_seconds: 2,
            shutdown_timeout_seconds: 60,
            health_check_interval_seconds: 60,
            cloud: CloudOptions::default(),
            default_host: None,
            ledger_path: PathBuf::from("ledger.db"),
        }
    }
}

/// Backoff shape for the retry/breaker client.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct RetryOptions {
    /// Retries per candidate host before falling through to the next (1-10).
    #[validate(minimum = 1)]
    #[validate(maximum = 10)]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[validate(minimum = 1)]
    pub initial_delay_ms: u64,

    /// Hard ceiling on any single computed delay, before jitter, in
    /// milliseconds.
    #[validate(minimum = 1)]
    pub max_delay_ms: u64,

    /// Multiplier applied per attempt.
    #[validate(minimum = 1.0)]
    pub exponential_base: f64,

    /// Whether to apply the `[0.5, 1.5)` jitter factor.
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

/// Circuit breaker shape: failure threshold and cooldown before a trial
/// half-open call is allowed through.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct BreakerOptions {
    /// Consecutive retryable failures before a breaker opens.
    #[validate(minimum = 1)]
    pub failure_threshold: u32,

    /// Minutes an open breaker stays open before a half-open trial call.
    #[validate(minimum = 1)]
    pub cooldown_minutes: u64,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_minutes: 5,
        }
    }
}

/// One configured executor/LLM endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct HostConfig {
    /// Unique host name, also the concurrency-pool and breaker key.
    #[validate(min_length = 1)]
    pub name: String,

    /// Base URL the client issues requests against.
    #[validate(min_length = 1)]
    pub url: String,

    /// Model name to send in LLM-handler requests, if this host is an LLM
    /// endpoint rather than an executor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Capabilities this host advertises (`code`, `text`, `reasoning`,
    /// `general`, `ops`, `dev`).
    #[validate(min_length = 1)]
    pub capabilities: Vec<String>,

    /// Smaller is preferred among otherwise-tied candidates.
    pub priority: u32,

    /// Per-call timeout, in seconds.
    #[validate(minimum = 1)]
    pub timeout_seconds: u64,
}

/// Telemetry wiring: structured events, the error tracker, and metrics.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Whether structured events and the error tracker are active at all.
    pub enabled: bool,

    /// Directory events.jsonl and errors.jsonl are appended to.
    pub log_dir: PathBuf,

    /// Whether the Prometheus `/metrics` HTTP server is started.
    pub enable_metrics: bool,

    /// Port the metrics server binds to.
    #[validate(minimum = 1)]
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: PathBuf::from("./yggdrasil-logs"),
            enable_metrics: true,
            metrics_port: 9090,
        }
    }
}

/// Cloud fallback wiring.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct CloudOptions {
    /// Whether cloud fallback is available at all.
    pub enabled: bool,

    /// Cloud endpoint base URL.
    pub endpoint: String,

    /// Name of the environment variable holding the bearer credential.
    pub credential_env: String,

    /// Task types that qualify for cloud fallback.
    pub qualifying_task_types: Vec<String>,
}

impl Default for CloudOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            credential_env: String::new(),
            qualifying_task_types: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_with_no_hosts_passes_field_validation() {
        // Field-level range validation passes; the zero-hosts rule is a
        // cross-field check enforced separately in `Config::check_startup`.
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn host_config_requires_at_least_one_capability() {
        let host = HostConfig {
            name: "fenrir".to_string(),
            url: "http://fenrir.local:5000".to_string(),
            model: None,
            capabilities: Vec::new(),
            priority: 1,
            timeout_seconds: 30,
        };
        assert!(host.validate().is_err());
    }

    #[test]
    fn retry_max_attempts_out_of_range_fails_validation() {
        let retry = RetryOptions { max_attempts: 11, ..RetryOptions::default() };
        assert!(retry.validate().is_err());
    }
}
