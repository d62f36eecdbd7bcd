// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The error tracker: full structured error reports persisted to a sidecar
//! file, with a 32 KB-truncated copy embedded in the ledger's `error` field.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{DispatchError, ErrorKind};

/// Maximum size, in bytes, of the error report embedded in a ledger record.
pub const MAX_EMBEDDED_BYTES: usize = 32 * 1024;

/// One full structured error report, independent of where it ends up
/// (sidecar file in full, ledger record truncated).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
    /// The task the error applies to.
    pub task_id: String,
    /// The classified error kind.
    pub kind: ErrorKind,
    /// Human-readable message (the `Display` text of the underlying error).
    pub message: String,
    /// The task's type, for grep-ability in the sidecar log.
    pub task_type: String,
    /// The host involved, if any.
    pub host: Option<String>,
    /// The task's attempt count at the time of this error.
    pub attempt_count: u32,
    /// Last bytes of handler output captured before the failure, if any.
    pub last_output: Option<String>,
}

impl ErrorReport {
    /// Build a report from a classified dispatch error and its task context.
    pub fn from_error(
        error: &DispatchError,
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        host: Option<String>,
        attempt_count: u32,
        last_output: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            task_id: task_id.into(),
            kind: error.kind(),
            message: error.to_string(),
            task_type: task_type.into(),
            host,
            attempt_count,
            last_output,
        }
    }

    /// Serialize to JSON, truncated to [`MAX_EMBEDDED_BYTES`] for embedding
    /// in the ledger's `error` field. Excess detail survives only in the
    /// sidecar log.
    pub fn truncated_json(&self) -> String {
        let full = serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"message\":\"{}\"}}", self.message));
        if full.len() <= MAX_EMBEDDED_BYTES {
            return full;
        }
        let mut end = MAX_EMBEDDED_BYTES;
        while !full.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...<truncated>", &full[..end])
    }
}

/// Persists full error reports as line-delimited JSON under
/// `observability.log_dir`, independent of the truncated copy embedded in
/// the ledger.
pub struct ErrorTracker {
    path: PathBuf,
}

impl ErrorTracker {
    /// Track errors into `{log_dir}/errors.jsonl`.
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        Self {
            path: log_dir.as_ref().join("errors.jsonl"),
        }
    }

    /// Append one full report to the sidecar file, creating it (and its
    /// parent directory) if necessary.
    pub async fn record(&self, report: &ErrorReport) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(report).expect("ErrorReport always serializes");
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_error() -> DispatchError {
        DispatchError::ServerError {
            host: "fenrir".to_string(),
            status: 500,
            message: "a".repeat(64 * 1024),
        }
    }

    #[test]
    fn truncation_respects_max_size_and_char_boundary() {
        let report = ErrorReport::from_error(&sample_error(), "t1", "text-processing", Some("fenrir".to_string()), 2, None);
        let truncated = report.truncated_json();
        assert!(truncated.len() <= MAX_EMBEDDED_BYTES + "...<truncated>".len());
        assert!(truncated.ends_with("...<truncated>"));
    }

    #[test]
    fn small_reports_are_not_truncated() {
        let error = DispatchError::Timeout(std::time::Duration::from_secs(5), "fenrir".to_string());
        let report = ErrorReport::from_error(&error, "t1", "text-processing", Some("fenrir".to_string()), 1, None);
        let rendered = report.truncated_json();
        assert!(!rendered.ends_with("...<truncated>"));
        assert!(rendered.contains("\"task_id\":\"t1\""));
    }

    #[tokio::test]
    async fn record_appends_jsonl_to_sidecar_file() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ErrorTracker::new(dir.path());
        let error = DispatchError::Internal("boom".to_string());
        let report = ErrorReport::from_error(&error, "t1", "general", None, 1, None);
        tracker.record(&report).await.unwrap();
        tracker.record(&report).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("errors.jsonl")).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
