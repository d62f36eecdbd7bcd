// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-host concurrency manager.
//!
//! One `tokio::sync::Semaphore` per configured host, sized at construction
//! and never mutated afterward — FIFO-fair among waiters by construction. A
//! `DashSet` of in-flight task IDs per host backs `status()`, following the
//! teacher's use of `dashmap` for concurrent bookkeeping structures.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::Semaphore;

use crate::error::DispatchError;

/// A held unit of one host's concurrency. Releases automatically on drop —
/// including on cancellation or an early return from a handler — so "release
/// exactly once per successful acquire" is the `Drop` impl itself rather than
/// a call callers must remember to make.
pub struct HostSlot {
    host: String,
    task_id: String,
    inflight: Arc<DashSet<String>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl HostSlot {
    /// The host this slot was acquired on.
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for HostSlot {
    fn drop(&mut self) {
        self.inflight.remove(&self.task_id);
    }
}

/// Per-host {active count, available count, in-flight task IDs}, for
/// observability.
#[derive(Debug, Clone)]
pub struct HostStatus {
    /// Tasks currently holding a slot on this host.
    pub active: usize,
    /// Slots available for immediate acquisition.
    pub available: usize,
    /// IDs of tasks currently holding a slot, for diagnostics.
    pub in_flight: Vec<String>,
}

/// Per-host semaphores plus in-flight bookkeeping.
pub struct HostPool {
    semaphores: HashMap<String, Arc<Semaphore>>,
    inflight: HashMap<String, Arc<DashSet<String>>>,
}

impl HostPool {
    /// Build a pool from `(host_name, concurrency_limit)` pairs. The host set
    /// is fixed for the life of the pool.
    pub fn new(limits: impl IntoIterator<Item = (String, usize)>) -> Self {
        let mut semaphores = HashMap::new();
        let mut inflight = HashMap::new();
        for (host, limit) in limits {
            semaphores.insert(host.clone(), Arc::new(Semaphore::new(limit.max(1))));
            inflight.insert(host, Arc::new(DashSet::new()));
        }
        Self { semaphores, inflight }
    }

    /// Whether `host` is configured in this pool.
    pub fn knows_host(&self, host: &str) -> bool {
        self.semaphores.contains_key(host)
    }

    /// The configured host names.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.semaphores.keys().map(|s| s.as_str())
    }

    /// Suspend until a slot on `host` is available, then register `task_id`
    /// as in-flight. Dropping the returned future before it resolves cancels
    /// the wait cleanly (no slot is held).
    pub async fn acquire(&self, host: &str, task_id: &str) -> Result<HostSlot, DispatchError> {
        let semaphore = self
            .semaphores
            .get(host)
            .ok_or_else(|| DispatchError::NotFound(format!("host {host}")))?
            .clone();
        let inflight = self
            .inflight
            .get(host)
            .expect("inflight set must exist for every configured host")
            .clone();
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::Shutdown)?;
        inflight.insert(task_id.to_string());
        Ok(HostSlot {
            host: host.to_string(),
            task_id: task_id.to_string(),
            inflight,
            _permit: permit,
        })
    }

    /// Per-host status snapshot.
    pub fn status(&self) -> HashMap<String, HostStatus> {
        self.semaphores
            .iter()
            .map(|(host, sem)| {
                let in_flight: Vec<String> = self
                    .inflight
                    .get(host)
                    .map(|set| set.iter().map(|e| e.clone()).collect())
                    .unwrap_or_default();
                (
                    host.clone(),
                    HostStatus {
                        active: in_flight.len(),
                        available: sem.available_permits(),
                        in_flight,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_then_drop_releases_slot() {
        let pool = HostPool::new([("fenrir-chat".to_string(), 1)]);
        {
            let _slot = pool.acquire("fenrir-chat", "t1").await.unwrap();
            let status = pool.status();
            assert_eq!(status["fenrir-chat"].available, 0);
            assert_eq!(status["fenrir-chat"].in_flight, vec!["t1".to_string()]);
        }
        let status = pool.status();
        assert_eq!(status["fenrir-chat"].available, 1);
        assert!(status["fenrir-chat"].in_flight.is_empty());
    }

    #[tokio::test]
    async fn concurrency_is_capped_per_host() {
        let pool = Arc::new(HostPool::new([("fenrir-chat".to_string(), 1)]));
        let _first = pool.acquire("fenrir-chat", "t1").await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire("fenrir-chat", "t2").await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second acquire must block while the first slot is held");

        drop(_first);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.host(), "fenrir-chat");
    }

    #[tokio::test]
    async fn unknown_host_is_not_found() {
        let pool = HostPool::new([("fenrir-chat".to_string(), 1)]);
        let err = pool.acquire("nonexistent", "t1").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
