// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The task and audit-entry data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A task's lifecycle status.
///
/// Terminal statuses (`Closed`, `Cancelled`) are monotonic: no permitted
/// transition table entry ever routes back to `Open` or `InProgress` from a
/// terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Ready to be picked up once its dependencies are closed.
    Open,
    /// Claimed by the dispatcher and assigned exactly one host slot.
    InProgress,
    /// Completed successfully. Terminal.
    Closed,
    /// Held by an operator or returned by the dispatcher after exhausting
    /// retries / a shutdown grace period. Terminal from the dispatcher's
    /// point of view; an operator may requeue it to `Open`.
    Blocked,
    /// Cancelled, advisory or otherwise. Terminal.
    Cancelled,
}

impl Status {
    /// Parse from the lowercase wire representation used in JSONL records.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "closed" => Some(Self::Closed),
            "blocked" => Some(Self::Blocked),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// The lowercase wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Closed => "closed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status can never transition away (per the ledger's own
    /// bookkeeping — an operator can still requeue a `Blocked` task, but the
    /// dispatcher treats it as terminal for itself).
    pub fn is_terminal_for_dispatcher(self) -> bool {
        matches!(self, Self::Closed | Self::Blocked | Self::Cancelled)
    }
}

/// A work item in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Stable string identity.
    pub id: String,
    /// Short human label, distinct from the opaque `description` payload.
    #[serde(default)]
    pub title: String,
    /// Opaque payload consumed by the handler.
    #[serde(default)]
    pub description: String,
    /// Integer 0-3, 0 = critical.
    pub priority: u8,
    /// Current lifecycle status.
    pub status: Status,
    /// Free-form tag used to select a handler.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Routing hints / capability labels.
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Handler-specific structured parameters.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Free-form structured metadata, read-only to the dispatcher.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Task IDs that must be `Closed` before this task becomes ready.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-modified timestamp.
    pub updated_at: DateTime<Utc>,
    /// Timestamp of the transition into a terminal status, if any.
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Non-negative, monotonically increasing attempt counter.
    #[serde(default)]
    pub attempt_count: u32,
    /// Handler output on success.
    #[serde(default)]
    pub result: Option<String>,
    /// Structured error report on failure, truncated to 32 KB.
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    /// Build a new `Open` task with no attempts, no dependencies resolved yet.
    pub fn new(id: impl Into<String>, task_type: impl Into<String>, priority: u8, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            description: String::new(),
            priority,
            status: Status::Open,
            task_type: task_type.into(),
            labels: BTreeSet::new(),
            params: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
            dependencies: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            closed_at: None,
            attempt_count: 0,
            result: None,
            error: None,
        }
    }
}

/// One append-only record of a ledger status transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// The task the transition applied to.
    pub task_id: String,
    /// Status before the transition.
    pub old_status: Status,
    /// Status after the transition.
    pub new_status: Status,
    /// When the transition was committed.
    pub ts: DateTime<Utc>,
    /// The task's attempt count at the time of this transition.
    pub attempt: u32,
    /// Optional human-readable note (e.g. a shutdown reason).
    #[serde(default)]
    pub message: Option<String>,
}

/// Fields an `update()` call may write alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct UpdateFields {
    /// Handler output to record on success.
    pub result: Option<String>,
    /// Structured error report to record on failure.
    pub error: Option<String>,
    /// Explicit attempt count to set; if `None`, the store increments the
    /// existing value only for the `in_progress -> open` requeue transition.
    pub attempt: Option<u32>,
    /// Optional audit message (e.g. a shutdown reason).
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_wire_string() {
        for s in [
            Status::Open,
            Status::InProgress,
            Status::Closed,
            Status::Blocked,
            Status::Cancelled,
        ] {
            assert_eq!(Status::from_str(s.as_str()), Some(s));
        }
        assert_eq!(Status::from_str("bogus"), None);
    }

    #[test]
    fn terminal_for_dispatcher() {
        assert!(Status::Closed.is_terminal_for_dispatcher());
        assert!(Status::Blocked.is_terminal_for_dispatcher());
        assert!(Status::Cancelled.is_terminal_for_dispatcher());
        assert!(!Status::Open.is_terminal_for_dispatcher());
        assert!(!Status::InProgress.is_terminal_for_dispatcher());
    }
}
