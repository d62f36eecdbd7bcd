// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Structured dispatcher events.
//!
//! A tagged enum carrying per-variant fields, serialized with an
//! internally-tagged representation (`#[serde(tag = "event")]`) so the wire
//! record is a flat `{timestamp, task_id, event, level, ...}` object rather
//! than a nested envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Log level attached to an event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Routine progress.
    Info,
    /// Recoverable, noteworthy condition.
    Warn,
    /// A bug or state the dispatcher cannot recover from locally.
    Error,
}

/// One structured dispatcher event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A task-processing unit acquired a slot and began execution.
    TaskStarted {
        /// The task being started.
        task_id: String,
        /// The host the task was dispatched to.
        host: String,
    },
    /// A retryable failure scheduled another attempt.
    TaskRetryScheduled {
        /// The task being retried.
        task_id: String,
        /// The host the retry targets.
        host: String,
        /// The attempt number about to run.
        attempt: u32,
        /// The computed backoff delay.
        delay_ms: u64,
    },
    /// A task reached a terminal `closed` status.
    TaskCompleted {
        /// The task that completed.
        task_id: String,
        /// The host that served it.
        host: String,
        /// Wall-clock duration of the whole dispatch attempt.
        duration_ms: u64,
        /// Input/output token counts, when the handler reports them.
        tokens_in: Option<u64>,
        /// Output token count, when the handler reports them.
        tokens_out: Option<u64>,
    },
    /// A task reached a terminal `blocked` status after one non-retryable
    /// failure (as opposed to exhausting retries).
    TaskFailed {
        /// The task that failed.
        task_id: String,
        /// The host that was in use, if any.
        host: Option<String>,
        /// A short classification of the failure.
        reason: String,
    },
    /// A task exhausted its retry budget across every candidate host.
    TaskFailedMaxRetries {
        /// The task that failed.
        task_id: String,
        /// Total attempts made.
        attempts: u32,
    },
    /// A host's health probe failed.
    HostUnhealthy {
        /// The host marked unhealthy.
        host: String,
        /// Why the probe was considered a failure.
        reason: String,
    },
    /// A circuit breaker moved to `open`.
    BreakerOpened {
        /// The host whose breaker opened.
        host: String,
        /// The consecutive failure count that triggered it.
        failure_count: u32,
    },
    /// A circuit breaker moved back to `closed`.
    BreakerClosed {
        /// The host whose breaker closed.
        host: String,
    },
    /// The dispatcher began its shutdown sequence.
    ShutdownBegin {
        /// Number of tasks in flight at the moment shutdown began.
        in_flight: usize,
    },
    /// The dispatcher finished its shutdown sequence.
    ShutdownEnd {
        /// Number of tasks forcibly marked `blocked`.
        blocked: usize,
    },
}

impl Event {
    /// The severity this event should be logged/recorded at.
    pub fn level(&self) -> Level {
        match self {
            Event::TaskFailed { .. } | Event::TaskFailedMaxRetries { .. } | Event::HostUnhealthy { .. } => {
                Level::Warn
            }
            Event::BreakerOpened { .. } => Level::Warn,
            _ => Level::Info,
        }
    }

    /// The task this event concerns, if any (shutdown and breaker events are
    /// process/host-scoped, not task-scoped).
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::TaskStarted { task_id, .. }
            | Event::TaskRetryScheduled { task_id, .. }
            | Event::TaskCompleted { task_id, .. }
            | Event::TaskFailed { task_id, .. }
            | Event::TaskFailedMaxRetries { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// A fully-formed record as written to the event log / broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// The task this event concerns, if any.
    pub task_id: Option<String>,
    /// Severity.
    pub level: Level,
    /// The event payload itself, flattened into this record on the wire.
    #[serde(flatten)]
    pub event: Event,
}

impl EventRecord {
    /// Stamp an [`Event`] with the current time and its own level/task_id.
    pub fn now(event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            task_id: event.task_id().map(|s| s.to_string()),
            level: event.level(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_record_serializes_flat_with_tag() {
        let record = EventRecord::now(Event::TaskStarted {
            task_id: "t1".to_string(),
            host: "fenrir-chat".to_string(),
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "task_started");
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["host"], "fenrir-chat");
        assert_eq!(json["level"], "info");
    }

    #[test]
    fn failure_events_are_warn_level() {
        assert_eq!(
            Event::HostUnhealthy {
                host: "h".into(),
                reason: "timeout".into()
            }
            .level(),
            Level::Warn
        );
        assert_eq!(
            Event::BreakerOpened { host: "h".into(), failure_count: 3 }.level(),
            Level::Warn
        );
        assert_eq!(
            Event::TaskCompleted {
                task_id: "t".into(),
                host: "h".into(),
                duration_ms: 1,
                tokens_in: None,
                tokens_out: None
            }
            .level(),
            Level::Info
        );
    }
}
