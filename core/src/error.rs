// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error kinds shared across the ledger, router, client, and handler registry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The classified kind of a dispatch-time failure.
///
/// Mirrors the error kinds enumerated for the retry/breaker client and the
/// ledger: these are the categories the retry client and the dispatcher loop
/// branch on, independent of the human-readable message carried alongside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A ledger status transition was not in the permitted transition table.
    InvalidTransition,
    /// A requested task, audit entry, or host was not found.
    NotFound,
    /// A concurrent writer already moved the task before this write landed.
    Conflict,
    /// An outbound call exceeded its configured timeout.
    Timeout,
    /// An outbound call could not establish or maintain a connection.
    ConnectionFailed,
    /// An outbound call returned a 5xx response.
    ServerError,
    /// An executor reported GPU/CUDA memory exhaustion.
    MemoryExhausted,
    /// A task's payload or a handler's response failed validation.
    InvalidPayload,
    /// Every candidate host (and the cloud fallback, if enabled) was exhausted.
    AllHostsUnavailable,
    /// The dispatcher is shutting down and abandoned the in-flight call.
    Shutdown,
    /// An error that does not fit any other classification.
    Internal,
}

impl ErrorKind {
    /// Whether the retry/breaker client should retry a failure of this kind.
    ///
    /// Per the propagation policy: the client recovers `timeout`,
    /// `connection_failed`, `server_error`, and `memory_exhausted` up to
    /// `max_attempts`, then escalates. Everything else is surfaced upward
    /// immediately.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionFailed | Self::ServerError | Self::MemoryExhausted
        )
    }
}

/// A classified dispatch-time error, carrying enough context to populate the
/// structured error report embedded in a ledger record.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The attempted ledger transition is not permitted from the task's
    /// current status.
    #[error("invalid transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// The task the transition was attempted on.
        task_id: String,
        /// The status the task was in.
        from: String,
        /// The status the transition attempted to move to.
        to: String,
    },

    /// The referenced task or audit trail does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another writer already moved the task underneath this write.
    #[error("conflict updating task {0}: status changed concurrently")]
    Conflict(String),

    /// The outbound call did not complete within its configured timeout.
    #[error("timeout after {0:?} calling host {1}")]
    Timeout(std::time::Duration, String),

    /// The outbound call failed to connect.
    #[error("connection to host {host} failed: {message}")]
    ConnectionFailed {
        /// The host that was unreachable.
        host: String,
        /// The underlying error text.
        message: String,
    },

    /// The outbound call returned a 5xx response.
    #[error("host {host} returned server error {status}: {message}")]
    ServerError {
        /// The host that returned the error.
        host: String,
        /// HTTP status code.
        status: u16,
        /// Response body or summary.
        message: String,
    },

    /// The executor or model runtime reported memory exhaustion.
    #[error("memory exhausted on host {host}: {message}")]
    MemoryExhausted {
        /// The host that reported exhaustion.
        host: String,
        /// Raw message (e.g. containing "CUDA OOM").
        message: String,
    },

    /// A task payload or handler response failed validation.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Every in-fleet candidate host and the cloud fallback (if any) were
    /// exhausted for this dispatch attempt.
    #[error("all hosts unavailable for task type {task_type}")]
    AllHostsUnavailable {
        /// The task type that could not be routed.
        task_type: String,
    },

    /// The dispatcher is shutting down; the call was abandoned.
    #[error("shutdown in progress")]
    Shutdown,

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// The classified kind of this error, for retry and ledger-report logic.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Timeout(..) => ErrorKind::Timeout,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::ServerError { .. } => ErrorKind::ServerError,
            Self::MemoryExhausted { .. } => ErrorKind::MemoryExhausted,
            Self::InvalidPayload(_) => ErrorKind::InvalidPayload,
            Self::AllHostsUnavailable { .. } => ErrorKind::AllHostsUnavailable,
            Self::Shutdown => ErrorKind::Shutdown,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the retry/breaker client should retry this failure.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<rusqlite::Error> for DispatchError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(format!("sqlite error: {e}"))
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidPayload(format!("json error: {e}"))
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(std::time::Duration::default(), e.url().map(|u| u.to_string()).unwrap_or_default())
        } else if e.is_connect() {
            Self::ConnectionFailed {
                host: e.url().map(|u| u.to_string()).unwrap_or_default(),
                message: e.to_string(),
            }
        } else {
            Self::Internal(format!("http error: {e}"))
        }
    }
}

/// Exit codes for the dispatcher binary, per the error handling design.
pub mod exit_codes {
    /// Normal shutdown.
    pub const SUCCESS: i32 = 0;
    /// Unexpected/unclassified error.
    pub const UNEXPECTED: i32 = 1;
    /// Configuration invalid.
    pub const CONFIG_INVALID: i32 = 2;
    /// Fatal I/O — ledger unavailable at start.
    pub const FATAL_IO: i32 = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::ConnectionFailed.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(ErrorKind::MemoryExhausted.is_retryable());
        assert!(!ErrorKind::InvalidPayload.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Shutdown.is_retryable());
    }

    #[test]
    fn error_kind_round_trip() {
        let err = DispatchError::AllHostsUnavailable {
            task_type: "reasoning".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::AllHostsUnavailable);
        assert!(!err.is_retryable());
    }
}
