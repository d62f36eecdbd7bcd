// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The durable ledger store.
//!
//! Backed by `rusqlite` (bundled SQLite) opened in WAL mode, following the
//! same struct-owns-a-lazily-opened-`Connection` shape used by the agent and
//! server database managers in the network-monitoring example repo this
//! pattern is grounded on. `rusqlite` is synchronous, so every operation runs
//! inside `tokio::task::spawn_blocking` against a `Connection` guarded by a
//! `std::sync::Mutex`; WAL mode is what actually gives concurrent readers a
//! consistent snapshot against the single in-process writer.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::DispatchError;

use super::model::{AuditEntry, Status, Task, UpdateFields};
use super::transitions::is_permitted;

/// The ledger's public contract, per the task dispatcher specification.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Tasks with `status = open` and every dependency `closed`, ordered by
    /// `(priority ascending, created_at ascending)`. A consistent snapshot.
    async fn ready_tasks(&self) -> Result<Vec<Task>, DispatchError>;

    /// Fetch one task by ID.
    async fn get(&self, task_id: &str) -> Result<Task, DispatchError>;

    /// Insert a new task. Fails with `Conflict` if the ID already exists.
    async fn create(&self, task: Task) -> Result<(), DispatchError>;

    /// Atomically validate and apply a status transition, writing the given
    /// fields and appending exactly one audit entry. Returns `Ok(false)`
    /// (rather than an error) specifically when the requested claim
    /// (`open -> in_progress`) lost a race to another writer; any other
    /// disallowed transition is `Err(InvalidTransition)`.
    async fn update(
        &self,
        task_id: &str,
        new_status: Status,
        fields: UpdateFields,
    ) -> Result<bool, DispatchError>;

    /// Every task in the ledger, in no particular order. Used by the JSONL
    /// exporter and the CLI's `ledger list` command, not by the dispatcher
    /// loop itself.
    async fn list_all(&self) -> Result<Vec<Task>, DispatchError>;

    /// Count of tasks per status.
    async fn stats(&self) -> Result<HashMap<String, u64>, DispatchError>;

    /// The ordered audit trail for one task.
    async fn audit(&self, task_id: &str) -> Result<Vec<AuditEntry>, DispatchError>;
}

/// A `rusqlite`-backed, write-ahead-logged ledger store.
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Open (creating if necessary) a ledger database file, applying schema
    /// migrations idempotently.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DispatchError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DispatchError::Internal(format!("creating ledger directory: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory ledger, useful for tests.
    pub fn open_in_memory() -> Result<Self, DispatchError> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn configure(conn: &Connection) -> Result<(), DispatchError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn migrate(conn: &Connection) -> Result<(), DispatchError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id             TEXT PRIMARY KEY,
                title          TEXT NOT NULL DEFAULT '',
                description    TEXT NOT NULL DEFAULT '',
                priority       INTEGER NOT NULL,
                status         TEXT NOT NULL,
                task_type      TEXT NOT NULL,
                labels         TEXT NOT NULL DEFAULT '[]',
                params         TEXT NOT NULL DEFAULT 'null',
                metadata       TEXT NOT NULL DEFAULT 'null',
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL,
                closed_at      TEXT,
                attempt_count  INTEGER NOT NULL DEFAULT 0,
                result         TEXT,
                error          TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_ready ON tasks(priority, created_at)
                WHERE status = 'open';

            CREATE TABLE IF NOT EXISTS task_dependencies (
                task_id       TEXT NOT NULL REFERENCES tasks(id),
                depends_on_id TEXT NOT NULL,
                PRIMARY KEY (task_id, depends_on_id)
            );
            CREATE INDEX IF NOT EXISTS idx_deps_depends_on ON task_dependencies(depends_on_id);

            CREATE TABLE IF NOT EXISTS audit_log (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id     TEXT NOT NULL,
                old_status  TEXT NOT NULL,
                new_status  TEXT NOT NULL,
                ts          TEXT NOT NULL,
                attempt     INTEGER NOT NULL,
                message     TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_audit_task_ts ON audit_log(task_id, ts, seq);
            "#,
        )?;
        Ok(())
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        let labels_json: String = row.get("labels")?;
        let params_json: String = row.get("params")?;
        let metadata_json: String = row.get("metadata")?;
        let status_str: String = row.get("status")?;
        let labels: BTreeSet<String> = serde_json::from_str(&labels_json).unwrap_or_default();
        let params: serde_json::Value = serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null);
        let metadata: serde_json::Value = serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null);
        let status = Status::from_str(&status_str).unwrap_or(Status::Open);

        Ok(Task {
            id: row.get("id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            priority: row.get::<_, i64>("priority")? as u8,
            status,
            task_type: row.get("task_type")?,
            labels,
            params,
            metadata,
            dependencies: BTreeSet::new(),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            closed_at: row.get("closed_at")?,
            attempt_count: row.get::<_, i64>("attempt_count")? as u32,
            result: row.get("result")?,
            error: row.get("error")?,
        })
    }

    fn load_dependencies(conn: &Connection, task_id: &str) -> Result<BTreeSet<String>, DispatchError> {
        let mut stmt = conn.prepare("SELECT depends_on_id FROM task_dependencies WHERE task_id = ?1")?;
        let rows = stmt.query_map(params![task_id], |row| row.get::<_, String>(0))?;
        let mut deps = BTreeSet::new();
        for r in rows {
            deps.insert(r?);
        }
        Ok(deps)
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn ready_tasks(&self) -> Result<Vec<Task>, DispatchError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("ledger connection mutex poisoned");
            let mut stmt = conn.prepare(
                r#"
                SELECT t.* FROM tasks t
                WHERE t.status = 'open'
                  AND NOT EXISTS (
                      SELECT 1 FROM task_dependencies d
                      JOIN tasks dep ON dep.id = d.depends_on_id
                      WHERE d.task_id = t.id AND dep.status != 'closed'
                  )
                ORDER BY t.priority ASC, t.created_at ASC
                "#,
            )?;
            let rows = stmt.query_map([], Self::row_to_task)?;
            let mut tasks = Vec::new();
            for r in rows {
                let mut task = r?;
                task.dependencies = Self::load_dependencies(&conn, &task.id)?;
                tasks.push(task);
            }
            Ok(tasks)
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("ledger task panicked: {e}")))?
    }

    async fn get(&self, task_id: &str) -> Result<Task, DispatchError> {
        let conn = self.conn.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("ledger connection mutex poisoned");
            let mut task: Task = conn
                .query_row("SELECT * FROM tasks WHERE id = ?1", params![task_id], Self::row_to_task)
                .optional()?
                .ok_or_else(|| DispatchError::NotFound(task_id.clone()))?;
            task.dependencies = Self::load_dependencies(&conn, &task_id)?;
            Ok(task)
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("ledger task panicked: {e}")))?
    }

    async fn create(&self, task: Task) -> Result<(), DispatchError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("ledger connection mutex poisoned");
            let tx = conn.transaction()?;
            let labels_json = serde_json::to_string(&task.labels)?;
            let params_json = serde_json::to_string(&task.params)?;
            let metadata_json = serde_json::to_string(&task.metadata)?;

            let inserted = tx.execute(
                r#"
                INSERT OR IGNORE INTO tasks
                    (id, title, description, priority, status, task_type, labels,
                     params, metadata, created_at, updated_at, closed_at,
                     attempt_count, result, error)
                VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                "#,
                params![
                    task.id,
                    task.title,
                    task.description,
                    task.priority as i64,
                    task.status.as_str(),
                    task.task_type,
                    labels_json,
                    params_json,
                    metadata_json,
                    task.created_at,
                    task.updated_at,
                    task.closed_at,
                    task.attempt_count as i64,
                    task.result,
                    task.error,
                ],
            )?;
            if inserted == 0 {
                return Err(DispatchError::Conflict(task.id.clone()));
            }
            for dep in &task.dependencies {
                tx.execute(
                    "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
                    params![task.id, dep],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("ledger task panicked: {e}")))?
    }

    async fn update(
        &self,
        task_id: &str,
        new_status: Status,
        fields: UpdateFields,
    ) -> Result<bool, DispatchError> {
        let conn = self.conn.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("ledger connection mutex poisoned");
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let (current_status, current_attempt): (String, i64) = tx
                .query_row(
                    "SELECT status, attempt_count FROM tasks WHERE id = ?1",
                    params![task_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| DispatchError::NotFound(task_id.clone()))?;
            let current_status = Status::from_str(&current_status).ok_or_else(|| {
                DispatchError::Internal(format!("corrupt status value for task {task_id}"))
            })?;

            if !is_permitted(current_status, new_status) {
                // A lost race on the initial claim is an expected conflict,
                // not a bug: report it so the caller releases its slot and
                // moves on rather than logging an invalid-transition error.
                if current_status != Status::Open && new_status == Status::InProgress {
                    return Ok(false);
                }
                return Err(DispatchError::InvalidTransition {
                    task_id: task_id.clone(),
                    from: current_status.as_str().to_string(),
                    to: new_status.as_str().to_string(),
                });
            }

            let now = Utc::now();
            let attempt = fields.attempt.unwrap_or(current_attempt as u32);
            let closed_at = if new_status.is_terminal_for_dispatcher() {
                Some(now)
            } else {
                None
            };

            tx.execute(
                r#"
                UPDATE tasks SET
                    status = ?1,
                    updated_at = ?2,
                    closed_at = COALESCE(?3, closed_at),
                    attempt_count = ?4,
                    result = COALESCE(?5, result),
                    error = COALESCE(?6, error)
                WHERE id = ?7
                "#,
                params![
                    new_status.as_str(),
                    now,
                    closed_at,
                    attempt as i64,
                    fields.result,
                    fields.error,
                    task_id,
                ],
            )?;

            tx.execute(
                r#"
                INSERT INTO audit_log (task_id, old_status, new_status, ts, attempt, message)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    task_id,
                    current_status.as_str(),
                    new_status.as_str(),
                    now,
                    attempt as i64,
                    fields.message,
                ],
            )?;

            tx.commit()?;
            Ok(true)
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("ledger task panicked: {e}")))?
    }

    async fn list_all(&self) -> Result<Vec<Task>, DispatchError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("ledger connection mutex poisoned");
            let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at ASC")?;
            let rows = stmt.query_map([], Self::row_to_task)?;
            let mut tasks = Vec::new();
            for r in rows {
                let mut task = r?;
                task.dependencies = Self::load_dependencies(&conn, &task.id)?;
                tasks.push(task);
            }
            Ok(tasks)
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("ledger task panicked: {e}")))?
    }

    async fn stats(&self) -> Result<HashMap<String, u64>, DispatchError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("ledger connection mutex poisoned");
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((status, count as u64))
            })?;
            let mut out = HashMap::new();
            for r in rows {
                let (status, count) = r?;
                out.insert(status, count);
            }
            Ok(out)
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("ledger task panicked: {e}")))?
    }

    async fn audit(&self, task_id: &str) -> Result<Vec<AuditEntry>, DispatchError> {
        let conn = self.conn.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("ledger connection mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT task_id, old_status, new_status, ts, attempt, message \
                 FROM audit_log WHERE task_id = ?1 ORDER BY ts ASC, seq ASC",
            )?;
            let rows = stmt.query_map(params![task_id], |row| {
                let old_status: String = row.get(1)?;
                let new_status: String = row.get(2)?;
                Ok(AuditEntry {
                    task_id: row.get(0)?,
                    old_status: Status::from_str(&old_status).unwrap_or(Status::Open),
                    new_status: Status::from_str(&new_status).unwrap_or(Status::Open),
                    ts: row.get(3)?,
                    attempt: row.get::<_, i64>(4)? as u32,
                    message: row.get(5)?,
                })
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("ledger task panicked: {e}")))?
    }
}

/// Helper used by handlers/the CLI to stamp a new task with the current time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
