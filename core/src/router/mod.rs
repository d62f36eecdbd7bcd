// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Task-type to host resolution, plus background health probing.
//!
//! Centralizes capability matching and health/priority tie-breaking in one
//! place, rather than scattering string-prefix routing across callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// A capability a host can advertise, matched against a task's required
/// capability before routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Code generation / completion models.
    Code,
    /// General text processing (summarization, extraction, rewriting).
    Text,
    /// Multi-step reasoning models.
    Reasoning,
    /// Catch-all capability every unrecognized task type falls back to.
    General,
    /// Operations / infrastructure executors.
    Ops,
    /// Developer-workspace executors (git, build, test).
    Dev,
}

impl Capability {
    /// Parse from the lowercase wire representation used in configuration.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "code" => Some(Self::Code),
            "text" => Some(Self::Text),
            "reasoning" => Some(Self::Reasoning),
            "general" => Some(Self::General),
            "ops" => Some(Self::Ops),
            "dev" => Some(Self::Dev),
            _ => None,
        }
    }

    /// The capability a task type requires. Unknown types fall back to
    /// `General`.
    pub fn for_task_type(task_type: &str) -> Self {
        match task_type {
            "code-generation" => Self::Code,
            "text-processing" => Self::Text,
            "reasoning" => Self::Reasoning,
            "summarize" => Self::Text,
            "general" => Self::General,
            t if t.starts_with("dev-") || t.starts_with("git-") => Self::Dev,
            t if t.starts_with("code-") => Self::Code,
            t if t.starts_with("ops-") || t.starts_with("power-") || t.starts_with("monitor-") || t.starts_with("network-") => {
                Self::Ops
            }
            t if t.starts_with("llm-") || t.starts_with("ollama-") || t.starts_with("plan-") => Self::Reasoning,
            _ => Self::General,
        }
    }
}

/// A configured executor/LLM endpoint. Immutable for the life of the
/// process except for the health flag, which the probe loop and the
/// breaker both update.
#[derive(Debug, Clone)]
pub struct HostDescriptor {
    /// Unique host name, also used as the concurrency-pool and breaker key.
    pub name: String,
    /// Base URL the client issues requests against.
    pub base_url: String,
    /// Capabilities this host advertises.
    pub capabilities: Vec<Capability>,
    /// Smaller is preferred among otherwise-tied candidates.
    pub priority: u32,
    /// Per-call timeout.
    pub timeout: Duration,
    /// Model name to send in LLM-handler requests to this host, if it is an
    /// LLM endpoint rather than an executor.
    pub model: Option<String>,
}

struct HealthState {
    healthy: RwLock<bool>,
}

/// Routes a task to a host: capability match, then health, then priority,
/// then round-robin among ties. Health is probed on a background interval
/// and may also be flipped by the retry/breaker client on repeated failure.
pub struct Router {
    hosts: Vec<HostDescriptor>,
    health: HashMap<String, HealthState>,
    default_host: Option<String>,
    round_robin: AtomicUsize,
}

impl Router {
    /// Build a router over the configured hosts. `default_host`, if set, is
    /// used when no host advertises the required (or fallback `general`)
    /// capability.
    pub fn new(hosts: Vec<HostDescriptor>, default_host: Option<String>) -> Self {
        let health = hosts
            .iter()
            .map(|h| {
                (
                    h.name.clone(),
                    HealthState {
                        healthy: RwLock::new(true),
                    },
                )
            })
            .collect();
        Self {
            hosts,
            health,
            default_host,
            round_robin: AtomicUsize::new(0),
        }
    }

    /// The configured host descriptors.
    pub fn hosts(&self) -> &[HostDescriptor] {
        &self.hosts
    }

    /// Look up one host descriptor by name.
    pub fn host(&self, name: &str) -> Option<&HostDescriptor> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Current health flag for a host. Unknown hosts are treated healthy.
    pub fn is_healthy(&self, host: &str) -> bool {
        self.health.get(host).map(|h| *h.healthy.read()).unwrap_or(true)
    }

    /// Flip a host's health flag. Called by the probe loop and by the
    /// retry/breaker client when a breaker opens or closes.
    pub fn set_healthy(&self, host: &str, healthy: bool) {
        if let Some(state) = self.health.get(host) {
            *state.healthy.write() = healthy;
        }
    }

    /// Resolve a task to an ordered list of candidate hosts: the preferred
    /// host first, followed by the remaining eligible hosts in priority
    /// order, so the retry/breaker client can fall through when the first
    /// candidate's breaker is open.
    ///
    /// A task label equal to a configured host name forces that host first
    /// (bypassing capability matching), but the rest of the capability-
    /// matched list still follows so the client has fallback candidates if
    /// the forced host is unavailable.
    pub fn resolve(&self, task_type: &str, labels: &std::collections::BTreeSet<String>) -> Result<Vec<String>, DispatchError> {
        let required = Capability::for_task_type(task_type);

        let mut candidates: Vec<&HostDescriptor> =
            self.hosts.iter().filter(|h| h.capabilities.contains(&required)).collect();

        if candidates.is_empty() && required != Capability::General {
            candidates = self.hosts.iter().filter(|h| h.capabilities.contains(&Capability::General)).collect();
        }

        if candidates.is_empty() {
            if let Some(default) = &self.default_host {
                if let Some(h) = self.host(default) {
                    return Ok(vec![h.name.clone()]);
                }
            }
            return Err(DispatchError::AllHostsUnavailable {
                task_type: task_type.to_string(),
            });
        }

        // Healthy before unhealthy, then smaller priority number, then a
        // stable name ordering (round-robin within ties is applied when
        // picking the head of the list, below).
        candidates.sort_by(|a, b| {
            let a_healthy = self.is_healthy(&a.name);
            let b_healthy = self.is_healthy(&b.name);
            b_healthy.cmp(&a_healthy).then(a.priority.cmp(&b.priority)).then(a.name.cmp(&b.name))
        });

        let mut ordered: Vec<String> = candidates.iter().map(|h| h.name.clone()).collect();

        // Round-robin among hosts tied on health+priority for the head slot.
        if ordered.len() > 1 {
            let top_priority = candidates[0].priority;
            let top_healthy = self.is_healthy(&candidates[0].name);
            let tied: Vec<usize> = candidates
                .iter()
                .enumerate()
                .take_while(|(_, h)| h.priority == top_priority && self.is_healthy(&h.name) == top_healthy)
                .map(|(i, _)| i)
                .collect();
            if tied.len() > 1 {
                let pick = self.round_robin.fetch_add(1, Ordering::Relaxed) % tied.len();
                ordered.swap(0, tied[pick]);
            }
        }

        if let Some(forced) = labels.iter().find(|l| self.host(l).is_some()) {
            ordered.retain(|h| h != forced);
            ordered.insert(0, forced.clone());
        }

        Ok(ordered)
    }

    /// Spawn the background health-probe loop. One GET per host per tick
    /// against `{base_url}/health`. Returns a handle the caller can abort
    /// on shutdown.
    pub fn spawn_health_probe(self: &Arc<Self>, client: reqwest::Client, interval: Duration) -> tokio::task::JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for host in router.hosts() {
                    let url = format!("{}/health", host.base_url.trim_end_matches('/'));
                    let ok = match client.get(&url).timeout(host.timeout).send().await {
                        Ok(resp) => resp.status().is_success(),
                        Err(_) => false,
                    };
                    router.set_healthy(&host.name, ok);
                }
            }
        })
    }
}
