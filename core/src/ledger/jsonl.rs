// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Line-delimited JSON import/export, the ledger's human-interchange format.
//!
//! One [`Task`] per line, independent of the SQLite schema used internally —
//! this is what an operator pipes through `jq`, diffs between snapshots, or
//! hands to another Yggdrasil instance.

use std::io::{BufRead, Write};

use crate::error::DispatchError;

use super::model::Task;
use super::store::Ledger;

/// Write every task in the ledger to `writer`, one JSON object per line.
pub async fn export_jsonl(ledger: &dyn Ledger, mut writer: impl Write) -> Result<usize, DispatchError> {
    let tasks = ledger.list_all().await?;
    let count = tasks.len();
    for task in tasks {
        let line = serde_json::to_string(&task)?;
        writeln!(writer, "{line}").map_err(|e| DispatchError::Internal(format!("writing jsonl: {e}")))?;
    }
    Ok(count)
}

/// Read tasks from `reader`, one JSON object per line, and create each in the
/// ledger. Blank lines are skipped. Returns the number of tasks created;
/// stops at the first task whose ID already exists.
pub async fn import_jsonl(ledger: &dyn Ledger, reader: impl BufRead) -> Result<usize, DispatchError> {
    let mut created = 0;
    for line in reader.lines() {
        let line = line.map_err(|e| DispatchError::Internal(format!("reading jsonl: {e}")))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let task: Task = serde_json::from_str(line)?;
        ledger.create(task).await?;
        created += 1;
    }
    Ok(created)
}
