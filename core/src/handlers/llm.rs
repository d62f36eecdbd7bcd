// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The LLM handler family: `code-generation`, `text-processing`,
//! `reasoning`, `summarize`, `general`.
//!
//! Builds an OpenAI-compatible chat completion request from the task's
//! description and params, and posts it to the routed host's
//! `/v1/chat/completions`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::DispatchError;
use crate::ledger::Task;

use super::{HandlerContext, HandlerOutcome, TaskHandler};

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

/// Handles the model-inference task types by issuing a chat completion
/// request to the routed host.
pub struct LlmHandler;

impl LlmHandler {
    /// Construct the handler. Stateless; all per-call configuration comes
    /// from the routed [`crate::router::HostDescriptor`] and the task.
    pub fn new() -> Self {
        Self
    }

    fn system_prompt(task_type: &str) -> &'static str {
        match task_type {
            "code-generation" => "You write correct, idiomatic code. Respond with the code only unless asked to explain.",
            "summarize" => "You summarize the given text concisely, preserving the key facts.",
            "reasoning" => "You work through the problem step by step before giving a final answer.",
            "text-processing" => "You process and transform the given text exactly as instructed.",
            _ => "You are a helpful automation assistant.",
        }
    }
}

impl Default for LlmHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for LlmHandler {
    async fn execute(&self, task: &Task, candidates: &[String], ctx: &HandlerContext) -> Result<HandlerOutcome, DispatchError> {
        let primary = candidates.first().ok_or_else(|| DispatchError::NotFound("no candidate host supplied".to_string()))?;
        let descriptor = ctx
            .router
            .host(primary)
            .ok_or_else(|| DispatchError::NotFound(format!("host {primary} not configured")))?;

        let model = descriptor.model.clone().unwrap_or_else(|| "default".to_string());
        let mut user_content = task.description.clone();
        if let Some(extra) = task.params.get("prompt").and_then(|v| v.as_str()) {
            user_content.push_str("\n\n");
            user_content.push_str(extra);
        }

        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": Self::system_prompt(&task.task_type)},
                {"role": "user", "content": user_content},
            ],
        });

        let response = ctx
            .client
            .dispatch(
                &ctx.router,
                candidates,
                &task.task_type,
                "/v1/chat/completions",
                &body,
                &|event| (ctx.on_event)(event),
            )
            .await?;

        let completion: ChatCompletion = serde_json::from_value(response.body)
            .map_err(|e| DispatchError::InvalidPayload(format!("malformed chat completion response: {e}")))?;

        let output = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| DispatchError::InvalidPayload("chat completion had no choices".to_string()))?;

        Ok(HandlerOutcome {
            output,
            tokens_in: completion.usage.as_ref().and_then(|u| u.prompt_tokens),
            tokens_out: completion.usage.as_ref().and_then(|u| u.completion_tokens),
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
                name: "fenrir".to_string(),
                base_url: format!("http://{addr}"),
                capabilities: vec![Capability::General],
                priority: 1,
                timeout: Duration::from_secs(5),
                model: Some("llama3".to_string()),
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
    async fn extracts_output_and_token_usage_from_response() {
        let app = axum::Router::new().route(
            "/v1/chat/completions",
            axum::routing::post(|| async {
                axum::Json(serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": "fn main() {}"}}],
                    "usage": {"prompt_tokens": 12, "completion_tokens": 4},
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let ctx = context_with_server(addr).await;
        let task = Task::new("t1".to_string(), "code-generation".to_string(), 5, crate::ledger::now());
        let handler = LlmHandler::new();
        let outcome = handler.execute(&task, &["fenrir".to_string()], &ctx).await.unwrap();

        assert_eq!(outcome.output, "fn main() {}");
        assert_eq!(outcome.tokens_in, Some(12));
        assert_eq!(outcome.tokens_out, Some(4));
        assert_eq!(outcome.host, "fenrir");
    }

    #[tokio::test]
    async fn missing_choices_is_invalid_payload() {
        let app = axum::Router::new().route(
            "/v1/chat/completions",
            axum::routing::post(|| async { axum::Json(serde_json::json!({"choices": []})) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let ctx = context_with_server(addr).await;
        let task = Task::new("t2".to_string(), "general".to_string(), 5, crate::ledger::now());
        let handler = LlmHandler::new();
        let err = handler.execute(&task, &["fenrir".to_string()], &ctx).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidPayload);
    }
}
