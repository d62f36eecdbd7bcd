// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The main polling/dispatch loop.
//!
//! A single cooperative-scheduling loop: sleep, drain the ready queue,
//! fan out one task-processing unit per ready task onto a `JoinSet`, and
//! on shutdown wait out a grace period before marking stragglers `blocked`.
//! Everything the loop touches is reached through the context bundle built
//! in [`Dispatcher::from_config`] — no process-wide singletons.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use tokio::task::JoinSet;

use crate::client::backoff::BackoffConfig;
use crate::client::breaker::BreakerConfig;
use crate::client::{CloudConfig, RetryClient, RetryConfig};
use crate::config::Config;
use crate::error::{DispatchError, ErrorKind};
use crate::handlers::{HandlerContext, HandlerRegistry};
use crate::hostpool::HostPool;
use crate::ledger::{Ledger, SqliteLedger, Status, Task, UpdateFields};
use crate::observability::error_tracker::{ErrorReport, ErrorTracker};
use crate::observability::events::Event;
use crate::observability::metrics::Metrics;
use crate::observability::EventBus;
use crate::router::{Capability, HostDescriptor, Router};

/// A boxed shutdown signal: resolves once, when the process should begin
/// its graceful shutdown sequence.
pub type ShutdownSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// What [`Dispatcher::run`] returns once the shutdown sequence completes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherSummary {
    /// Tasks still in flight when the shutdown grace period elapsed, forced
    /// to `blocked` with their slots released.
    pub blocked_on_shutdown: usize,
}

/// The context bundle plus timing knobs the dispatch loop needs. Built once
/// at startup (see [`Dispatcher::from_config`]) and shared via `Arc` across
/// every task-processing unit.
pub struct Dispatcher {
    ledger: Arc<dyn Ledger>,
    host_pool: Arc<HostPool>,
    router: Arc<Router>,
    client: Arc<RetryClient>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    metrics: Option<Arc<Metrics>>,
    error_tracker: Option<Arc<ErrorTracker>>,
    poll_interval: Duration,
    shutdown_timeout: Duration,
    in_flight: Arc<DashSet<String>>,
}

impl Dispatcher {
    /// Assemble a dispatcher from already-constructed components. Prefer
    /// [`Dispatcher::from_config`] unless a caller (e.g. a test) needs to
    /// substitute a component.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        host_pool: Arc<HostPool>,
        router: Arc<Router>,
        client: Arc<RetryClient>,
        handlers: Arc<HandlerRegistry>,
        events: Arc<EventBus>,
        metrics: Option<Arc<Metrics>>,
        error_tracker: Option<Arc<ErrorTracker>>,
        poll_interval: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            host_pool,
            router,
            client,
            handlers,
            events,
            metrics,
            error_tracker,
            poll_interval,
            shutdown_timeout,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Build every component from a validated [`Config`], and open (or
    /// create) the ledger database at `config.ledger_path`.
    pub fn from_config(config: &Config, events: Arc<EventBus>) -> Result<Arc<Self>, DispatchError> {
        let ledger: Arc<dyn Ledger> = Arc::new(SqliteLedger::open(&config.ledger_path)?);

        let descriptors: Vec<HostDescriptor> = config
            .hosts
            .iter()
            .map(|h| HostDescriptor {
                name: h.name.clone(),
                base_url: h.url.clone(),
                capabilities: h
                    .capabilities
                    .iter()
                    .filter_map(|c| Capability::from_str(c))
                    .collect(),
                priority: h.priority,
                timeout: Duration::from_secs(h.timeout_seconds),
                model: h.model.clone(),
            })
            .collect();
        let router = Arc::new(Router::new(descriptors, config.default_host.clone()));

        let limits = config.hosts.iter().map(|h| {
            let limit = config.concurrency.get(&h.name).copied().unwrap_or(1) as usize;
            (h.name.clone(), limit)
        });
        let host_pool = Arc::new(HostPool::new(limits));

        let retry = RetryConfig {
            max_attempts: config.retry.max_attempts,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(config.retry.initial_delay_ms),
                max_delay: Duration::from_millis(config.retry.max_delay_ms),
                exponential_base: config.retry.exponential_base,
                jitter: config.retry.jitter,
            },
            breaker: BreakerConfig {
                failure_threshold: config.breaker.failure_threshold,
                cooldown: Duration::from_secs(config.breaker.cooldown_minutes * 60),
            },
        };
        let cloud = CloudConfig {
            enabled: config.cloud.enabled,
            endpoint: config.cloud.endpoint.clone(),
            credential: if config.cloud.credential_env.is_empty() {
                String::new()
            } else {
                std::env::var(&config.cloud.credential_env).unwrap_or_default()
            },
            qualifying_task_types: config.cloud.qualifying_task_types.clone(),
        };
        let client = Arc::new(RetryClient::new(retry, cloud)?);

        let handlers = Arc::new(HandlerRegistry::with_defaults());

        let metrics = if config.observability.enable_metrics {
            Some(Arc::new(Metrics::new().map_err(|e| DispatchError::Internal(format!("metrics: {e}")))?))
        } else {
            None
        };
        let error_tracker = config
            .observability
            .enabled
            .then(|| Arc::new(ErrorTracker::new(&config.observability.log_dir)));

        if config.observability.enabled {
            events.spawn_file_writer(&config.observability.log_dir);
        }

        router.spawn_health_probe(reqwest::Client::new(), Duration::from_secs(config.health_check_interval_seconds));

        Ok(Arc::new(Self::new(
            ledger,
            host_pool,
            router,
            client,
            handlers,
            events,
            metrics,
            error_tracker,
            Duration::from_secs(config.poll_interval_seconds),
            Duration::from_secs(config.shutdown_timeout_seconds),
        )))
    }

    /// Per-host concurrency and health snapshot, for a CLI `status` command.
    pub fn host_status(&self) -> std::collections::HashMap<String, crate::hostpool::HostStatus> {
        self.host_pool.status()
    }

    /// The ledger backing this dispatcher, for CLI commands that share a
    /// running process with it (rare; normally the CLI opens its own
    /// [`SqliteLedger`] handle against the same file).
    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// The metrics registry, if `observability.enable_metrics` was set, so
    /// the CLI's `run` command can bind its own `/metrics` HTTP listener
    /// alongside the dispatch loop.
    pub fn metrics(&self) -> Option<Arc<Metrics>> {
        self.metrics.clone()
    }

    fn emit(&self, event: Event) {
        self.events.publish(event);
    }

    /// Run the dispatch loop until `shutdown` resolves, then drain
    /// in-flight work within the configured grace period and return a
    /// summary.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) -> DispatcherSummary {
        let mut shutdown = shutdown;
        let mut units: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.poll_once(&mut units).await;
                }
                Some(_) = units.join_next(), if !units.is_empty() => {}
            }
        }

        self.shutdown_sequence(units).await
    }

    /// One polling tick: drain the ready queue and spawn a processing unit
    /// for every task not already in flight.
    async fn poll_once(self: &Arc<Self>, units: &mut JoinSet<()>) {
        let ready = match self.ledger.ready_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(error = %e, "failed to query ready tasks");
                return;
            }
        };

        for task in ready {
            if self.in_flight.contains(&task.id) {
                continue;
            }
            self.in_flight.insert(task.id.clone());
            let dispatcher = self.clone();
            units.spawn(async move {
                dispatcher.process_task(task).await;
            });
        }
    }

    /// One task-processing unit: acquire, claim, invoke, commit, release —
    /// in that order, on every exit path.
    async fn process_task(self: Arc<Self>, task: Task) {
        let task_id = task.id.clone();
        self.process_task_inner(&task).await;
        self.in_flight.remove(&task_id);
    }

    async fn process_task_inner(self: &Arc<Self>, task: &Task) {
        let candidates = match self.router.resolve(&task.task_type, &task.labels) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "no host available for task type; leaving open for the next poll");
                return;
            }
        };
        let primary = candidates[0].clone();

        let slot = match self.host_pool.acquire(&primary, &task.id).await {
            Ok(slot) => slot,
            Err(e) => {
                tracing::error!(task_id = %task.id, host = %primary, error = %e, "failed to acquire host slot");
                return;
            }
        };

        let next_attempt = task.attempt_count + 1;
        let claim = self
            .ledger
            .update(
                &task.id,
                Status::InProgress,
                UpdateFields {
                    attempt: Some(next_attempt),
                    ..Default::default()
                },
            )
            .await;

        let claimed = match claim {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "invalid transition claiming task; leaving in prior state");
                false
            }
        };
        if !claimed {
            drop(slot);
            return;
        }

        self.emit(Event::TaskStarted { task_id: task.id.clone(), host: primary.clone() });
        let started = Instant::now();

        let ctx = HandlerContext {
            ledger: self.ledger.clone(),
            router: self.router.clone(),
            client: self.client.clone(),
            on_event: {
                let events = self.events.clone();
                Arc::new(move |event: Event| events.publish(event))
            },
        };

        let outcome = match self.handlers.resolve(&task.task_type) {
            Some(handler) => handler.execute(task, &candidates, &ctx).await,
            None => Err(DispatchError::InvalidPayload(format!(
                "no handler registered for task type {}",
                task.task_type
            ))),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        drop(slot);

        match outcome {
            Ok(result) => self.finish_success(task, &result, duration_ms).await,
            Err(err) => self.finish_failure(task, &primary, next_attempt, &err, duration_ms).await,
        }
    }

    async fn finish_success(&self, task: &Task, result: &crate::handlers::HandlerOutcome, duration_ms: u64) {
        if let Err(e) = self
            .ledger
            .update(
                &task.id,
                Status::Closed,
                UpdateFields {
                    result: Some(result.output.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::error!(task_id = %task.id, error = %e, "failed to commit closed status");
        }

        self.emit(Event::TaskCompleted {
            task_id: task.id.clone(),
            host: result.host.clone(),
            duration_ms,
            tokens_in: result.tokens_in,
            tokens_out: result.tokens_out,
        });

        if let Some(metrics) = &self.metrics {
            metrics.record_task(&result.host, "closed", Some(duration_ms as f64));
            metrics.record_tokens(&result.host, result.tokens_in, result.tokens_out);
        }
    }

    async fn finish_failure(&self, task: &Task, host: &str, attempt: u32, err: &DispatchError, duration_ms: u64) {
        let report = ErrorReport::from_error(err, &task.id, &task.task_type, Some(host.to_string()), attempt, None);
        let truncated = report.truncated_json();

        if let Some(tracker) = &self.error_tracker {
            let _ = tracker.record(&report).await;
        }

        if let Err(e) = self
            .ledger
            .update(
                &task.id,
                Status::Blocked,
                UpdateFields {
                    error: Some(truncated),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::error!(task_id = %task.id, error = %e, "failed to commit blocked status");
        }

        if err.kind() == ErrorKind::AllHostsUnavailable {
            self.emit(Event::TaskFailedMaxRetries { task_id: task.id.clone(), attempts: attempt });
        } else {
            self.emit(Event::TaskFailed {
                task_id: task.id.clone(),
                host: Some(host.to_string()),
                reason: err.to_string(),
            });
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_task(host, "blocked", Some(duration_ms as f64));
        }
    }

    /// Wait up to `shutdown_timeout` for in-flight units to finish, then
    /// force-block whatever remains and release its slot.
    async fn shutdown_sequence(self: Arc<Self>, mut units: JoinSet<()>) -> DispatcherSummary {
        let in_flight = self.in_flight.len();
        self.emit(Event::ShutdownBegin { in_flight });

        let deadline = tokio::time::sleep(self.shutdown_timeout);
        tokio::pin!(deadline);
        loop {
            if units.is_empty() {
                break;
            }
            tokio::select! {
                _ = &mut deadline => break,
                res = units.join_next() => {
                    if res.is_none() {
                        break;
                    }
                }
            }
        }

        let stragglers: Vec<String> = self.in_flight.iter().map(|e| e.clone()).collect();
        let mut blocked = 0usize;
        for task_id in stragglers {
            let result = self
                .ledger
                .update(
                    &task_id,
                    Status::Blocked,
                    UpdateFields {
                        error: Some("shutdown".to_string()),
                        message: Some("dispatcher shutdown grace period elapsed".to_string()),
                        ..Default::default()
                    },
                )
                .await;
            if result.is_ok() {
                blocked += 1;
            }
            self.in_flight.remove(&task_id);
        }
        units.abort_all();
        while units.join_next().await.is_some() {}

        self.emit(Event::ShutdownEnd { blocked });
        DispatcherSummary { blocked_on_shutdown: blocked }
    }
}
