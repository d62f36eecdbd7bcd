// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The task-type to handler registry.
//!
//! A typed map from task type to a handler value implementing the small
//! [`TaskHandler`] trait. Registration is explicit at startup (see
//! [`HandlerRegistry::with_defaults`]).

pub mod executor;
pub mod llm;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::RetryClient;
use crate::error::DispatchError;
use crate::ledger::{Ledger, Task};
use crate::observability::events::Event;
use crate::router::Router;

/// Shared dependencies a handler needs to do its work: the ledger (for
/// handlers that need to peek at other tasks, read-only), the router and
/// outbound client, and an event sink for structured logging. Bundled
/// together and passed into the dispatcher at construction, rather than
/// reached for through process-wide singletons.
pub struct HandlerContext {
    /// The ledger, read-only from a handler's point of view (the dispatcher
    /// owns all status-transition writes).
    pub ledger: Arc<dyn Ledger>,
    /// The router, for handlers that need to resolve an executor host
    /// beyond the one the dispatcher already picked (rare; most handlers
    /// use the host supplied in [`TaskHandler::execute`]).
    pub router: Arc<Router>,
    /// The resilient outbound client.
    pub client: Arc<RetryClient>,
    /// Emits a structured event (see [`crate::observability::events`]).
    pub on_event: Arc<dyn Fn(Event) + Send + Sync>,
}

/// A handler's successful result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerOutcome {
    /// The text written to the task's `result` field.
    pub output: String,
    /// Input tokens consumed, when the handler's backend reports them.
    #[serde(default)]
    pub tokens_in: Option<u64>,
    /// Output tokens produced, when the handler's backend reports them.
    #[serde(default)]
    pub tokens_out: Option<u64>,
    /// The host that ultimately served the task.
    pub host: String,
}

/// A handler executes one task type given the shared context bundle.
/// Handlers are stateless with respect to process lifetime; any side
/// effects must be idempotent or gated by the ledger's `in_progress`
/// status.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute `task`, having already been routed by the dispatcher.
    /// `candidates` is the router's ordered host list for this task
    /// (`candidates[0]` is the host the dispatcher acquired a concurrency
    /// slot on); a handler should hand the whole list to
    /// [`crate::client::RetryClient::dispatch`] so a breaker-open primary
    /// falls through to the next candidate rather than failing outright.
    /// Returns a classified [`DispatchError`] on failure so the
    /// retry/breaker client and dispatcher loop can react appropriately.
    async fn execute(&self, task: &Task, candidates: &[String], ctx: &HandlerContext) -> Result<HandlerOutcome, DispatchError>;
}

/// The task-type to handler mapping. Exact match on the full task type is
/// tried first; failing that, the longest matching executor-family prefix
/// is used.
pub struct HandlerRegistry {
    exact: HashMap<String, Arc<dyn TaskHandler>>,
    prefixes: Vec<(String, Arc<dyn TaskHandler>)>,
}

/// Executor-family prefixes recognized by the dispatch handler.
pub const EXECUTOR_PREFIXES: &[&str] = &[
    "dev-", "code-", "git-", "llm-", "ollama-", "ops-", "power-", "monitor-", "network-", "plan-",
];

impl HandlerRegistry {
    /// An empty registry; handlers must be registered explicitly.
    pub fn new() -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: Vec::new(),
        }
    }

    /// Register a handler for an exact task-type match.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.exact.insert(task_type.into(), handler);
    }

    /// Register a handler for every task type starting with `prefix`.
    pub fn register_prefix(&mut self, prefix: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.prefixes.push((prefix.into(), handler));
    }

    /// The registry pre-populated with the built-in handler families: the
    /// LLM handlers on exact task-type match, and the executor-dispatch
    /// handler on every recognized prefix.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let llm_handler: Arc<dyn TaskHandler> = Arc::new(llm::LlmHandler::new());
        for task_type in ["code-generation", "text-processing", "reasoning", "summarize", "general"] {
            registry.register(task_type, llm_handler.clone());
        }
        let executor_handler: Arc<dyn TaskHandler> = Arc::new(executor::ExecutorHandler::new());
        for prefix in EXECUTOR_PREFIXES {
            registry.register_prefix(*prefix, executor_handler.clone());
        }
        registry
    }

    /// Resolve a handler for `task_type`: exact match first, then the
    /// longest matching prefix.
    pub fn resolve(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        if let Some(handler) = self.exact.get(task_type) {
            return Some(handler.clone());
        }
        self.prefixes
            .iter()
            .filter(|(prefix, _)| task_type.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| handler.clone())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub;

    #[async_trait]
    impl TaskHandler for Stub {
        async fn execute(&self, _task: &Task, candidates: &[String], _ctx: &HandlerContext) -> Result<HandlerOutcome, DispatchError> {
            Ok(HandlerOutcome { output: String::new(), tokens_in: None, tokens_out: None, host: candidates[0].clone() })
        }
    }

    #[test]
    fn exact_match_wins_over_prefix() {
        let mut registry = HandlerRegistry::new();
        registry.register_prefix("dev-", Arc::new(Stub));
        registry.register("dev-exact-thing", Arc::new(Stub));
        assert!(registry.resolve("dev-exact-thing").is_some());
    }

    #[test]
    fn longest_prefix_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register_prefix("dev-", Arc::new(Stub));
        registry.register_prefix("dev-build-", Arc::new(Stub));
        // Both match "dev-build-x"; can't distinguish stubs by identity here,
        // but resolving must not panic and must pick one deterministically.
        assert!(registry.resolve("dev-build-x").is_some());
    }

    #[test]
    fn unknown_type_resolves_to_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve("nonexistent").is_none());
    }

    #[test]
    fn defaults_cover_llm_types_and_executor_prefixes() {
        let registry = HandlerRegistry::with_defaults();
        for t in ["code-generation", "text-processing", "reasoning", "summarize", "general"] {
            assert!(registry.resolve(t).is_some(), "{t} should resolve");
        }
        for prefix in EXECUTOR_PREFIXES {
            assert!(registry.resolve(&format!("{prefix}anything")).is_some());
        }
    }
}
