// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Prometheus metrics, served over `axum` at `/metrics` and `/metrics.json`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::Mutex;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use serde_json::{json, Value};

const ROLLING_WINDOW: Duration = Duration::from_secs(300);

/// Task counts, duration percentiles, token counts, and uptime, plus the
/// rolling-window bookkeeping needed to compute `ygg_task_duration_ms`.
pub struct Metrics {
    registry: Registry,
    tasks_total: IntCounterVec,
    task_duration_ms: GaugeVec,
    tokens_total: IntCounterVec,
    uptime_seconds: Gauge,
    started_at: Instant,
    durations: Mutex<HashMap<String, VecDeque<(Instant, f64)>>>,
}

impl Metrics {
    /// Build and register every metric family against a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tasks_total = IntCounterVec::new(Opts::new("ygg_tasks_total", "Total tasks processed"), &["host", "status"])?;
        registry.register(Box::new(tasks_total.clone()))?;

        let task_duration_ms = GaugeVec::new(
            Opts::new("ygg_task_duration_ms", "Task duration percentiles over a rolling 5-minute window"),
            &["host", "percentile"],
        )?;
        registry.register(Box::new(task_duration_ms.clone()))?;

        let tokens_total = IntCounterVec::new(Opts::new("ygg_tokens_total", "Total tokens processed"), &["host", "type"])?;
        registry.register(Box::new(tokens_total.clone()))?;

        let uptime_seconds = Gauge::new("ygg_uptime_seconds", "Process uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry,
            tasks_total,
            task_duration_ms,
            tokens_total,
            uptime_seconds,
            started_at: Instant::now(),
            durations: Mutex::new(HashMap::new()),
        })
    }

    /// Record a completed task: bumps the per-host/status counter and, on
    /// success, folds the duration into the rolling percentile window.
    pub fn record_task(&self, host: &str, status: &str, duration_ms: Option<f64>) {
        self.tasks_total.with_label_values(&[host, status]).inc();
        if let Some(ms) = duration_ms {
            self.record_duration(host, ms);
        }
    }

    /// Record input/output token counts for a completed task.
    pub fn record_tokens(&self, host: &str, tokens_in: Option<u64>, tokens_out: Option<u64>) {
        if let Some(n) = tokens_in {
            self.tokens_total.with_label_values(&[host, "in"]).inc_by(n);
        }
        if let Some(n) = tokens_out {
            self.tokens_total.with_label_values(&[host, "out"]).inc_by(n);
        }
    }

    fn record_duration(&self, host: &str, ms: f64) {
        let now = Instant::now();
        let mut durations = self.durations.lock();
        let window = durations.entry(host.to_string()).or_default();
        window.push_back((now, ms));
        while let Some((ts, _)) = window.front() {
            if now.duration_since(*ts) > ROLLING_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        let mut sorted: Vec<f64> = window.iter().map(|(_, v)| *v).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for (label, q) in [("50", 0.50), ("95", 0.95), ("99", 0.99)] {
            let value = percentile(&sorted, q);
            self.task_duration_ms.with_label_values(&[host, label]).set(value);
        }
    }

    /// Refresh the uptime gauge. Called just before a metrics scrape.
    pub fn tick_uptime(&self) {
        self.uptime_seconds.set(self.started_at.elapsed().as_secs_f64());
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render_text(&self) -> String {
        self.tick_uptime();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer).expect("prometheus text encoding never fails for well-formed metrics");
        String::from_utf8(buffer).expect("prometheus text output is always valid utf-8")
    }

    /// Render the registry as a structured JSON document.
    pub fn render_json(&self) -> Value {
        self.tick_uptime();
        let families = self.registry.gather();
        let mut out = Vec::new();
        for family in &families {
            let mut metrics = Vec::new();
            for metric in family.get_metric() {
                let labels: Value = metric
                    .get_label()
                    .iter()
                    .map(|l| (l.get_name().to_string(), Value::String(l.get_value().to_string())))
                    .collect::<serde_json::Map<_, _>>()
                    .into();
                let value = if metric.has_counter() {
                    json!(metric.get_counter().get_value())
                } else if metric.has_gauge() {
                    json!(metric.get_gauge().get_value())
                } else if metric.has_histogram() {
                    json!({
                        "sample_count": metric.get_histogram().get_sample_count(),
                        "sample_sum": metric.get_histogram().get_sample_sum(),
                    })
                } else {
                    Value::Null
                };
                metrics.push(json!({"labels": labels, "value": value}));
            }
            out.push(json!({
                "name": family.get_name(),
                "help": family.get_help(),
                "metrics": metrics,
            }));
        }
        json!({"families": out})
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

async fn metrics_text(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        metrics.render_text(),
    )
}

async fn metrics_json(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    axum::Json(metrics.render_json())
}

/// Build the `axum::Router` serving `/metrics` and `/metrics.json`, ready to
/// be bound and served on `observability.metrics_port`.
pub fn router(metrics: Arc<Metrics>) -> axum::Router {
    axum::Router::new()
        .route("/metrics", get(metrics_text))
        .route("/metrics.json", get(metrics_json))
        .with_state(metrics)
}
