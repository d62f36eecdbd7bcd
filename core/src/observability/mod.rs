// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Structured events, Prometheus metrics, and the error tracker.

pub mod error_tracker;
pub mod events;
pub mod metrics;

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use events::{Event, EventRecord};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Publishes structured events to any live subscribers (the metrics server,
/// the sidecar-file writer task) over a broadcast channel.
///
/// Publishing is synchronous and non-blocking: handlers and the dispatcher
/// loop call [`EventBus::publish`] from ordinary (possibly non-async)
/// contexts, and the broadcast channel buffers for slow subscribers up to
/// its capacity.
pub struct EventBus {
    sender: broadcast::Sender<EventRecord>,
}

impl EventBus {
    /// Build a bus with room for `EVENT_CHANNEL_CAPACITY` buffered events.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Record `event` with the current timestamp and broadcast it. A send
    /// with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(EventRecord::now(event));
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.sender.subscribe()
    }

    /// Spawn a background task that drains a fresh subscription and appends
    /// each record as one line of JSON to `{log_dir}/events.jsonl`.
    pub fn spawn_file_writer(&self, log_dir: impl Into<PathBuf>) -> tokio::task::JoinHandle<()> {
        let mut receiver = self.subscribe();
        let path = log_dir.into().join("events.jsonl");
        tokio::spawn(async move {
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            loop {
                match receiver.recv().await {
                    Ok(record) => {
                        if let Ok(mut line) = serde_json::to_string(&record) {
                            line.push('\n');
                            if let Ok(mut file) = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await {
                                let _ = file.write_all(line.as_bytes()).await;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the configured log directory, used by both the event file writer
/// and the error tracker's sidecar log.
pub fn log_dir(configured: &Path) -> PathBuf {
    configured.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::Level;

    #[tokio::test]
    async fn publish_is_received_by_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::TaskStarted { task_id: "t1".to_string(), host: "fenrir".to_string() });
        let record = rx.recv().await.unwrap();
        assert_eq!(record.task_id.as_deref(), Some("t1"));
        assert_eq!(record.level, Level::Info);
    }

    #[tokio::test]
    async fn file_writer_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let handle = bus.spawn_file_writer(dir.path());

        bus.publish(Event::TaskStarted { task_id: "t1".to_string(), host: "fenrir".to_string() });
        bus.publish(Event::TaskCompleted {
            task_id: "t1".to_string(),
            host: "fenrir".to_string(),
            duration_ms: 10,
            tokens_in: None,
            tokens_out: None,
        });

        // Give the background task a chance to drain both events.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();

        let contents = tokio::fs::read_to_string(dir.path().join("events.jsonl")).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
