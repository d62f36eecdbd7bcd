// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The executor-dispatch handler family: every task type matching one of
//! the `dev-`, `code-`, `git-`, `llm-`, `ollama-`, `ops-`, `power-`,
//! `monitor-`, `network-`, `plan-` prefixes.
//!
//! Posts `{task_id, type, params}` to the routed host's `/execute` and
//! returns the executor's response verbatim.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::DispatchError;
use crate::ledger::Task;

use super::{HandlerContext, HandlerOutcome, TaskHandler};

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    duration_seconds: Option<f64>,
}

/// Dispatches a task to an executor host's `/execute` endpoint.
pub struct ExecutorHandler;

impl ExecutorHandler {
    /// Construct the handler. Stateless.
    pub fn new() -> Self {
        Self
    }
}

impl Default for ExecutorHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for ExecutorHandler {
    async fn execute(&self, task: &Task, candidates: &[String], ctx: &HandlerContext) -> Result<HandlerOutcome, DispatchError> {
        let body = json!({
            "task_id": task.id,
            "type": task.task_type,
            "params": task.params,
        });

        let response = ctx
            .client
            .dispatch(&ctx.router, candidates, &task.task_type, "/execute", &body, &|event| (ctx.on_event)(event))
            .await?;

        let decoded: ExecuteResponse = serde_json::from_value(response.body)
            .map_err(|e| DispatchError::InvalidPayload(format!("malformed executor response: {e}")))?;

        if decoded.status != "completed" {
            return Err(DispatchError::InvalidPayload(format!(
                "executor reported non-completed status: {}",
                decoded.status
            )));
        }

        Ok(HandlerOutcome {
            output: decoded.output,
            tokens_in: None,
            tokens_out: None,
            host: response.host,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CloudConfig, RetryClient, RetryConfig};
    use crate::ledger::SqliteLedger;
    use crate::router::{Capability, HostDescriptor, Router};
    use std::sync::Arc;
    use std::time::Duration;

    async fn context_with_server(addr: std::net::SocketAddr) -> HandlerContext {
        let router = Arc::new(Router::new(
            vec![HostDescriptor {
                name: "odin".to_string(),
                base_url: format!("http://{addr}"),
                capabilities: vec![Capability::Ops],
                priority: 1,
                timeout: Duration::from_secs(5),
                model: None,
            }],
            None,
        ));
        let client = Arc::new(
            RetryClient::new(
                RetryConfig { max_attempts: 1, ..Default::default() },
                CloudConfig { enabled: false, endpoint: String::new(), credential: String::new(), qualifying_task_types: vec![] },
            )
            .unwrap(),
        );
        let ledger = Arc::new(SqliteLedger::open_in_memory().unwrap());
        HandlerContext {
            ledger,
            router,
            client,
            on_event: Arc::new(|_| {}),
        }
    }

    #[tokio::test]
    async fn returns_executor_output_on_completed_status() {
        let app = axum::Router::new().route(
            "/execute",
            axum::routing::post(|| async {
                axum::Json(serde_json::json!({"status": "completed", "output": "rebooted", "duration_seconds": 1.5}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let ctx = context_with_server(addr).await;
        let task = Task::new("t1".to_string(), "ops-reboot".to_string(), 5, crate::ledger::now());
        let handler = ExecutorHandler::new();
        let outcome = handler.execute(&task, &["odin".to_string()], &ctx).await.unwrap();

        assert_eq!(outcome.output, "rebooted");
        assert_eq!(outcome.host, "odin");
    }

    #[tokio::test]
    async fn non_completed_status_is_invalid_payload() {
        let app = axum::Router::new().route(
            "/execute",
            axum::routing::post(|| async { axum::Json(serde_json::json!({"status": "failed", "output": "disk full"})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let ctx = context_with_server(addr).await;
        let task = Task::new("t2".to_string(), "dev-build".to_string(), 5, crate::ledger::now());
        let handler = ExecutorHandler::new();
        let err = handler.execute(&task, &["odin".to_string()], &ctx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidPayload);
    }
}
