// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The resilient outbound client: retry with backoff+jitter, a per-host
//! circuit breaker, and graceful fallback to a cloud endpoint.
//!
//! One `reqwest::Client` is built once with `rustls-tls` and pooled
//! connections; every call carries a per-call timeout and can land on any
//! configured host or the cloud fallback endpoint.

pub mod backoff;
pub mod breaker;

use std::time::Duration;

use serde::Serialize;

use crate::error::DispatchError;
use crate::observability::events::Event;
use crate::router::Router;

use backoff::{jittered_delay, BackoffConfig};
use breaker::{BreakerConfig, BreakerState, CircuitBreaker};

/// Cloud fallback wiring.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Whether cloud fallback is available at all.
    pub enabled: bool,
    /// Cloud endpoint base URL.
    pub endpoint: String,
    /// Bearer credential read from `credential_env` at startup.
    pub credential: String,
    /// Task types that qualify for cloud fallback (model-inference types).
    pub qualifying_task_types: Vec<String>,
}

impl CloudConfig {
    fn qualifies(&self, task_type: &str) -> bool {
        self.enabled && self.qualifying_task_types.iter().any(|t| t == task_type)
    }
}

/// Shape of one dispatch attempt.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries per candidate host before falling through to the next.
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    pub breaker: BreakerConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// The outcome of one successful dispatch attempt.
pub struct ClientResponse {
    /// The host (or `"cloud"`) that ultimately served the call.
    pub host: String,
    /// Decoded JSON response body.
    pub body: serde_json::Value,
    /// Total attempts made across all candidate hosts.
    pub attempts: u32,
}

/// An event the client wants recorded, surfaced back to the dispatcher loop
/// so it can log/emit without the client depending on the event sink
/// directly.
pub type EventSink<'a> = dyn Fn(Event) + Send + Sync + 'a;

/// The retry/breaker/cloud-fallback outbound client.
pub struct RetryClient {
    http: reqwest::Client,
    breaker: CircuitBreaker,
    retry: RetryConfig,
    cloud: CloudConfig,
}

impl RetryClient {
    /// Build a client. One `reqwest::Client` is shared across every call
    /// this process makes, per-call timeouts are applied individually.
    pub fn new(retry: RetryConfig, cloud: CloudConfig) -> Result<Self, DispatchError> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| DispatchError::Internal(format!("building http client: {e}")))?;
        Ok(Self {
            http,
            breaker: CircuitBreaker::new(retry.breaker),
            retry,
            cloud,
        })
    }

    /// Current breaker state for a host, for observability.
    pub fn breaker_state(&self, host: &str) -> BreakerState {
        self.breaker.state(host)
    }

    /// Execute one outbound call, trying `candidates` in order, retrying
    /// each with backoff up to `max_attempts`, falling through to the next
    /// candidate on exhaustion, and finally trying the cloud endpoint if
    /// `task_type` qualifies. `path` is joined onto each candidate host's
    /// base URL (or the cloud endpoint) as-is.
    #[allow(clippy::too_many_arguments)]
    pub async fn dispatch(
        &self,
        router: &Router,
        candidates: &[String],
        task_type: &str,
        path: &str,
        body: &impl Serialize,
        on_event: &EventSink<'_>,
    ) -> Result<ClientResponse, DispatchError> {
        let mut total_attempts = 0u32;

        for host_name in candidates {
            let Some(host) = router.host(host_name) else { continue };

            if !self.breaker.allows_call(host_name) {
                continue;
            }

            for attempt in 1..=self.retry.max_attempts {
                total_attempts += 1;
                let url = format!("{}{}", host.base_url.trim_end_matches('/'), path);
                let result = self.http.post(&url).timeout(host.timeout).json(body).send().await;

                match self.classify(result, host.timeout).await {
                    Ok(decoded) => {
                        if self.breaker.record_success(host_name) {
                            router.set_healthy(host_name, true);
                            on_event(Event::BreakerClosed { host: host_name.clone() });
                        }
                        return Ok(ClientResponse {
                            host: host_name.clone(),
                            body: decoded,
                            attempts: total_attempts,
                        });
                    }
                    Err(err) if err.is_retryable() => {
                        let opened = self.breaker.record_failure(host_name);
                        if opened {
                            router.set_healthy(host_name, false);
                            on_event(Event::BreakerOpened {
                                host: host_name.clone(),
                                failure_count: self.breaker.failure_count(host_name),
                            });
                            break;
                        }
                        if attempt < self.retry.max_attempts {
                            let delay = jittered_delay(&self.retry.backoff, attempt);
                            on_event(Event::TaskRetryScheduled {
                                task_id: String::new(),
                                host: host_name.clone(),
                                attempt: attempt + 1,
                                delay_ms: delay.as_millis() as u64,
                            });
                            tokio::time::sleep(delay).await;
                        }
                    }
                    Err(non_retryable) => return Err(non_retryable),
                }
            }
        }

        if self.cloud.qualifies(task_type) {
            total_attempts += 1;
            let url = format!("{}{}", self.cloud.endpoint.trim_end_matches('/'), path);
            let result = self
                .http
                .post(&url)
                .bearer_auth(&self.cloud.credential)
                .timeout(Duration::from_secs(60))
                .json(body)
                .send()
                .await;
            if let Ok(decoded) = self.classify(result, Duration::from_secs(60)).await {
                return Ok(ClientResponse {
                    host: "cloud".to_string(),
                    body: decoded,
                    attempts: total_attempts,
                });
            }
        }

        Err(DispatchError::AllHostsUnavailable {
            task_type: task_type.to_string(),
        })
    }

    /// Classify a completed (or failed-to-complete) request: retryable
    /// transport/5xx/OOM failures vs. non-retryable 4xx/decode/schema
    /// failures.
    async fn classify(
        &self,
        result: Result<reqwest::Response, reqwest::Error>,
        timeout: Duration,
    ) -> Result<serde_json::Value, DispatchError> {
        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(DispatchError::Timeout(timeout, e.url().map(|u| u.to_string()).unwrap_or_default())),
            Err(e) if e.is_connect() => {
                return Err(DispatchError::ConnectionFailed {
                    host: e.url().map(|u| u.to_string()).unwrap_or_default(),
                    message: e.to_string(),
                })
            }
            Err(e) => return Err(DispatchError::ConnectionFailed { host: String::new(), message: e.to_string() }),
        };

        let status = response.status();
        let host = response.url().to_string();
        if status.is_success() {
            let text = response.text().await.map_err(|e| DispatchError::ConnectionFailed { host: host.clone(), message: e.to_string() })?;
            let value: serde_json::Value =
                serde_json::from_str(&text).map_err(|e| DispatchError::InvalidPayload(format!("decode error: {e}")))?;
            if is_memory_exhausted(&text) {
                return Err(DispatchError::MemoryExhausted { host, message: text });
            }
            return Ok(value);
        }

        let body_text = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.is_server_error() {
            if is_memory_exhausted(&body_text) {
                return Err(DispatchError::MemoryExhausted { host, message: body_text });
            }
            return Err(DispatchError::ServerError { host, status: status.as_u16(), message: body_text });
        }
        Err(DispatchError::InvalidPayload(format!("http {}: {}", status.as_u16(), body_text)))
    }
}

fn is_memory_exhausted(text: &str) -> bool {
    text.contains("GPU out of memory") || text.contains("CUDA OOM") || text.contains("out of memory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{Capability, HostDescriptor};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn make_router(name: &str, url: String) -> Router {
        Router::new(
            vec![HostDescriptor {
                name: name.to_string(),
                base_url: url,
                capabilities: vec![Capability::Text],
                priority: 1,
                timeout: Duration::from_secs(2),
                model: None,
            }],
            None,
        )
    }

    #[tokio::test]
    async fn succeeds_on_first_try_against_live_server() {
        let app = axum::Router::new().route(
            "/execute",
            axum::routing::post(|| async { axum::Json(serde_json::json!({"status": "completed", "output": "hello"})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let router = make_router("h", format!("http://{addr}"));
        let client = RetryClient::new(
            RetryConfig { max_attempts: 1, ..Default::default() },
            CloudConfig { enabled: false, endpoint: String::new(), credential: String::new(), qualifying_task_types: vec![] },
        )
        .unwrap();

        let events = Arc::new(AtomicU32::new(0));
        let events2 = events.clone();
        let result = client
            .dispatch(&router, &["h".to_string()], "text-processing", "/execute", &serde_json::json!({}), &move |_| {
                events2.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(result.host, "h");
        assert_eq!(result.body["output"], "hello");
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds_and_breaker_stays_closed() {
        use axum::response::IntoResponse;
        let call_count = Arc::new(AtomicU32::new(0));
        let counter = call_count.clone();
        let app = axum::Router::new().route(
            "/execute",
            axum::routing::post(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
                    } else {
                        axum::Json(serde_json::json!({"status": "completed", "output": "ok"})).into_response()
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let router = make_router("h", format!("http://{addr}"));
        let client = RetryClient::new(
            RetryConfig {
                max_attempts: 3,
                backoff: BackoffConfig {
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    exponential_base: 2.0,
                    jitter: true,
                },
                breaker: BreakerConfig { failure_threshold: 3, cooldown: Duration::from_secs(60) },
            },
            CloudConfig { enabled: false, endpoint: String::new(), credential: String::new(), qualifying_task_types: vec![] },
        )
        .unwrap();

        let result = client
            .dispatch(&router, &["h".to_string()], "text-processing", "/execute", &serde_json::json!({}), &|_| {})
            .await
            .unwrap();

        assert_eq!(result.body["output"], "ok");
        assert_eq!(result.attempts, 3);
        assert_eq!(client.breaker_state("h"), BreakerState::Closed);
    }

    #[tokio::test]
    async fn falls_back_to_cloud_when_host_unavailable() {
        let cloud_app = axum::Router::new().route(
            "/execute",
            axum::routing::post(|| async { axum::Json(serde_json::json!({"status": "completed", "output": "fallback"})) }),
        );
        let cloud_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cloud_addr = cloud_listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(cloud_listener, cloud_app).await.unwrap() });

        // Unroutable host: nothing listening on this port.
        let router = make_router("h", "http://127.0.0.1:1".to_string());
        let client = RetryClient::new(
            RetryConfig {
                max_attempts: 1,
                backoff: BackoffConfig { initial_delay: Duration::from_millis(1), max_delay: Duration::from_millis(1), exponential_base: 1.0, jitter: true },
                breaker: BreakerConfig { failure_threshold: 1, cooldown: Duration::from_secs(60) },
            },
            CloudConfig {
                enabled: true,
                endpoint: format!("http://{cloud_addr}"),
                credential: "token".to_string(),
                qualifying_task_types: vec!["text-processing".to_string()],
            },
        )
        .unwrap();

        let result = client
            .dispatch(&router, &["h".to_string()], "text-processing", "/execute", &serde_json::json!({}), &|_| {})
            .await
            .unwrap();

        assert_eq!(result.host, "cloud");
        assert_eq!(result.body["output"], "fallback");
    }

    #[tokio::test]
    async fn falls_through_to_second_candidate_before_cloud() {
        let app = axum::Router::new().route(
            "/execute",
            axum::routing::post(|| async { axum::Json(serde_json::json!({"status": "completed", "output": "from-b"})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let router = Router::new(
            vec![
                HostDescriptor {
                    name: "a".to_string(),
                    base_url: "http://127.0.0.1:1".to_string(),
                    capabilities: vec![Capability::Ops],
                    priority: 1,
                    timeout: Duration::from_millis(200),
                    model: None,
                },
                HostDescriptor {
                    name: "b".to_string(),
                    base_url: format!("http://{addr}"),
                    capabilities: vec![Capability::Ops],
                    priority: 2,
                    timeout: Duration::from_secs(2),
                    model: None,
                },
            ],
            None,
        );
        let client = RetryClient::new(
            RetryConfig {
                max_attempts: 1,
                backoff: BackoffConfig { initial_delay: Duration::from_millis(1), max_delay: Duration::from_millis(1), exponential_base: 1.0, jitter: false },
                breaker: BreakerConfig { failure_threshold: 1, cooldown: Duration::from_secs(60) },
            },
            CloudConfig { enabled: false, endpoint: String::new(), credential: String::new(), qualifying_task_types: vec![] },
        )
        .unwrap();

        let result = client
            .dispatch(&router, &["a".to_string(), "b".to_string()], "ops-reboot", "/execute", &serde_json::json!({}), &|_| {})
            .await
            .unwrap();

        assert_eq!(result.host, "b");
        assert_eq!(result.body["output"], "from-b");
        assert_eq!(client.breaker_state("a"), BreakerState::Open);
    }

    #[test]
    fn memory_exhaustion_is_detected() {
        assert!(is_memory_exhausted("error: CUDA OOM"));
        assert!(is_memory_exhausted("GPU out of memory during generation"));
        assert!(!is_memory_exhausted("invalid request"));
    }
}
