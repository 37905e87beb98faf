//! Durable queue of records awaiting remote delivery.
//!
//! A record lives in the queue if and only if its remote write has not been
//! confirmed. The queue is loaded fully into memory when opened and rewritten
//! to disk after every mutation:
//!
//! - `unsynced.json`: `{ "time_logs": [...], "screenshots": [...] }`
//! - `unsynced_app_logs.json`: `[...]`
//!
//! # Ordering
//!
//! Time-log mutations (insert, then idle updates, then the closing update)
//! must be applied remotely in the order they were produced. A flush replays
//! them front to back and stops at the first failure. Screenshots and app logs
//! are independent, and a failure only keeps that one item queued.
//!
//! Items are never dropped. Once the backlog exceeds the warning threshold,
//! every enqueue logs a warning.
//!
//! # Example
//!
//! ```no_run
//! use timeflow_agent::queue::DurableQueue;
//! use timeflow_agent::remote::MemoryStore;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = DurableQueue::open("/tmp/timeflow", 1000)?;
//! let report = queue.flush(&MemoryStore::new()).await;
//! println!("delivered {} remaining {}", report.delivered, report.remaining);
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::remote::RemoteStore;
use crate::sync::deliver;
use crate::types::{
    AppLogEntry, QueueItem, QueueKind, QueuedRecord, ScreenshotMeta, TimeLogMutation,
};
use crate::utils::{read_json, write_json_atomic};

/// Backing file for time-log mutations and screenshot metadata.
pub const UNSYNCED_FILE: &str = "unsynced.json";

/// Backing file for app log entries.
pub const UNSYNCED_APP_LOGS_FILE: &str = "unsynced_app_logs.json";

/// Errors that can occur while opening the queue.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The data directory could not be created.
    #[error("failed to prepare queue directory {}: {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct UnsyncedData {
    #[serde(default)]
    time_logs: Vec<QueueItem<TimeLogMutation>>,
    #[serde(default)]
    screenshots: Vec<QueueItem<ScreenshotMeta>>,
}

#[derive(Debug, Default)]
struct Backlog {
    unsynced: UnsyncedData,
    app_logs: Vec<QueueItem<AppLogEntry>>,
}

impl Backlog {
    fn counts(&self) -> QueueCounts {
        QueueCounts {
            time_logs: self.unsynced.time_logs.len(),
            screenshots: self.unsynced.screenshots.len(),
            app_logs: self.app_logs.len(),
        }
    }
}

/// Number of queued records per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub time_logs: usize,
    pub screenshots: usize,
    pub app_logs: usize,
}

impl QueueCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.time_logs + self.screenshots + self.app_logs
    }

    #[must_use]
    pub fn of(&self, kind: QueueKind) -> usize {
        match kind {
            QueueKind::TimeLog => self.time_logs,
            QueueKind::Screenshot => self.screenshots,
            QueueKind::AppLog => self.app_logs,
        }
    }
}

/// Outcome of a [`DurableQueue::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Records confirmed by the remote store and removed from the queue.
    pub delivered: usize,
    /// Records still queued after the flush.
    pub remaining: usize,
}

/// Local store of records whose remote write has not been confirmed.
///
/// All access to the in-memory lists goes through one async mutex, which is
/// never held across a remote call. At most one flush runs at a time.
#[derive(Debug)]
pub struct DurableQueue {
    unsynced_path: PathBuf,
    app_logs_path: PathBuf,
    backlog: Mutex<Backlog>,
    flush_lock: Mutex<()>,
    warn_threshold: usize,
}

impl DurableQueue {
    /// Opens the queue stored in `dir`, loading any records left by a previous run.
    ///
    /// A queue file that cannot be parsed is renamed aside with a `.corrupt-*`
    /// suffix and the queue starts empty for that file.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Directory`] if `dir` cannot be created.
    pub fn open(dir: impl AsRef<Path>, warn_threshold: usize) -> Result<Self, QueueError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| QueueError::Directory {
            path: dir.to_path_buf(),
            source,
        })?;

        let unsynced_path = dir.join(UNSYNCED_FILE);
        let app_logs_path = dir.join(UNSYNCED_APP_LOGS_FILE);

        let backlog = Backlog {
            unsynced: load_or_quarantine(&unsynced_path),
            app_logs: load_or_quarantine(&app_logs_path),
        };

        let counts = backlog.counts();
        if counts.total() > 0 {
            info!(
                time_logs = counts.time_logs,
                screenshots = counts.screenshots,
                app_logs = counts.app_logs,
                "Loaded unsynced records from disk"
            );
        }

        Ok(Self {
            unsynced_path,
            app_logs_path,
            backlog: Mutex::new(backlog),
            flush_lock: Mutex::new(()),
            warn_threshold,
        })
    }

    /// Appends `record` and persists the queue. Returns the new backlog size.
    pub async fn enqueue(&self, record: QueuedRecord) -> usize {
        let kind = record.kind();

        let total = {
            let mut backlog = self.backlog.lock().await;
            match record {
                QueuedRecord::TimeLog(mutation) => backlog
                    .unsynced
                    .time_logs
                    .push(QueueItem::new(kind, mutation)),
                QueuedRecord::Screenshot(meta) => backlog
                    .unsynced
                    .screenshots
                    .push(QueueItem::new(kind, meta)),
                QueuedRecord::AppLog(entry) => {
                    backlog.app_logs.push(QueueItem::new(kind, entry));
                }
            }
            self.persist(&backlog, kind);
            backlog.counts().total()
        };

        debug!(kind = ?kind, total, "Record queued for later delivery");

        if total > self.warn_threshold {
            warn!(
                total,
                threshold = self.warn_threshold,
                "Unsynced backlog above warning threshold"
            );
        }

        total
    }

    /// Replays a snapshot of the queue against `remote`.
    ///
    /// Each record is removed only after its delivery succeeds. Records enqueued
    /// while the flush runs are left for the next one. Flushes run one at a
    /// time; a call made while another is running waits for it, then replays
    /// whatever that one left behind.
    pub async fn flush(&self, remote: &dyn RemoteStore) -> FlushReport {
        let _flushing = match self.flush_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                info!("Flush already in progress, waiting for it to finish");
                self.flush_lock.lock().await
            }
        };

        let (time_logs, screenshots, app_logs) = {
            let backlog = self.backlog.lock().await;
            (
                backlog.unsynced.time_logs.clone(),
                backlog.unsynced.screenshots.clone(),
                backlog.app_logs.clone(),
            )
        };

        if time_logs.is_empty() && screenshots.is_empty() && app_logs.is_empty() {
            return FlushReport::default();
        }

        let mut delivered = 0;
        delivered += self
            .replay(remote, time_logs, QueuedRecord::TimeLog, true)
            .await;
        delivered += self
            .replay(remote, screenshots, QueuedRecord::Screenshot, false)
            .await;
        delivered += self
            .replay(remote, app_logs, QueuedRecord::AppLog, false)
            .await;

        let remaining = self.len().await;
        info!(delivered, remaining, "Queue flush complete");

        FlushReport {
            delivered,
            remaining,
        }
    }

    async fn replay<T>(
        &self,
        remote: &dyn RemoteStore,
        items: Vec<QueueItem<T>>,
        wrap: fn(T) -> QueuedRecord,
        stop_on_failure: bool,
    ) -> usize {
        let mut delivered = 0;

        for item in items {
            let record = wrap(item.payload);
            match deliver(remote, &record).await {
                Ok(()) => {
                    if self.remove(item.kind, item.id).await {
                        delivered += 1;
                    }
                }
                Err(e) => {
                    warn!(
                        kind = ?item.kind,
                        item_id = %item.id,
                        error = %e,
                        "Queued record still undeliverable"
                    );
                    if stop_on_failure {
                        break;
                    }
                }
            }
        }

        delivered
    }

    async fn remove(&self, kind: QueueKind, id: Uuid) -> bool {
        let mut backlog = self.backlog.lock().await;
        let removed = match kind {
            QueueKind::TimeLog => remove_by_id(&mut backlog.unsynced.time_logs, id),
            QueueKind::Screenshot => remove_by_id(&mut backlog.unsynced.screenshots, id),
            QueueKind::AppLog => remove_by_id(&mut backlog.app_logs, id),
        };
        if removed {
            self.persist(&backlog, kind);
        }
        removed
    }

    fn persist(&self, backlog: &Backlog, kind: QueueKind) {
        let result = match kind {
            QueueKind::TimeLog | QueueKind::Screenshot => {
                write_json_atomic(&self.unsynced_path, &backlog.unsynced)
            }
            QueueKind::AppLog => write_json_atomic(&self.app_logs_path, &backlog.app_logs),
        };

        if let Err(e) = result {
            error!(
                kind = ?kind,
                error = %e,
                "Failed to persist queue, records kept in memory only"
            );
        }
    }

    /// Per-kind backlog sizes.
    pub async fn counts(&self) -> QueueCounts {
        self.backlog.lock().await.counts()
    }

    /// Total number of queued records.
    pub async fn len(&self) -> usize {
        self.counts().await.total()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns `true` if any record of `kind` is waiting.
    pub async fn has_pending(&self, kind: QueueKind) -> bool {
        self.counts().await.of(kind) > 0
    }

    /// Returns `true` while the insert of time log `id` is still queued.
    pub async fn has_time_log_insert(&self, id: &str) -> bool {
        self.backlog
            .lock()
            .await
            .unsynced
            .time_logs
            .iter()
            .any(|item| {
                matches!(&item.payload, TimeLogMutation::Insert { entry } if entry.id == id)
            })
    }

    /// Copy of the queued time-log mutations, oldest first.
    pub async fn time_logs(&self) -> Vec<QueueItem<TimeLogMutation>> {
        self.backlog.lock().await.unsynced.time_logs.clone()
    }

    /// Copy of the queued screenshot metadata, oldest first.
    pub async fn screenshots(&self) -> Vec<QueueItem<ScreenshotMeta>> {
        self.backlog.lock().await.unsynced.screenshots.clone()
    }

    /// Copy of the queued app log entries, oldest first.
    pub async fn app_logs(&self) -> Vec<QueueItem<AppLogEntry>> {
        self.backlog.lock().await.app_logs.clone()
    }
}

fn remove_by_id<T>(items: &mut Vec<QueueItem<T>>, id: Uuid) -> bool {
    match items.iter().position(|item| item.id == id) {
        Some(index) => {
            items.remove(index);
            true
        }
        None => false,
    }
}

fn load_or_quarantine<T: DeserializeOwned + Default>(path: &Path) -> T {
    match read_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            let mut quarantine = path.as_os_str().to_os_string();
            quarantine.push(format!(".corrupt-{}", Utc::now().timestamp()));
            let quarantine = PathBuf::from(quarantine);

            error!(
                path = %path.display(),
                moved_to = %quarantine.display(),
                error = %e,
                "Unreadable queue file, moving it aside"
            );
            if let Err(e) = fs::rename(path, &quarantine) {
                error!(path = %path.display(), error = %e, "Failed to move corrupt queue file");
            }
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryStore, RemoteError};
    use crate::types::{TimeLogEntry, TimeLogPatch, TIME_LOGS_TABLE};
    use async_trait::async_trait;
    use serde_json::Value;
    use tempfile::TempDir;

    fn screenshot(n: u32) -> QueuedRecord {
        QueuedRecord::Screenshot(ScreenshotMeta {
            user_id: "u1".to_string(),
            task_id: format!("t{n}"),
            time_log_id: None,
            captured_at: Utc::now(),
            local_path: None,
            image_url: Some(format!("https://cdn/{n}.png")),
        })
    }

    fn app_log(name: &str) -> QueuedRecord {
        QueuedRecord::AppLog(AppLogEntry {
            user_id: "u1".to_string(),
            task_id: "t1".to_string(),
            time_log_id: None,
            app_name: name.to_string(),
            window_title: "window".to_string(),
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            duration_seconds: Some(0),
        })
    }

    /// Store whose time-log updates always fail.
    struct RejectsUpdates(MemoryStore);

    #[async_trait]
    impl RemoteStore for RejectsUpdates {
        async fn insert(&self, table: &str, record: &Value) -> Result<String, RemoteError> {
            self.0.insert(table, record).await
        }

        async fn update(&self, _: &str, _: &str, _: &Value) -> Result<(), RemoteError> {
            Err(RemoteError::Rejected {
                status: 503,
                message: "maintenance".to_string(),
            })
        }

        async fn upload(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> Result<String, RemoteError> {
            self.0.upload(bucket, path, bytes).await
        }
    }

    #[tokio::test]
    async fn enqueued_records_survive_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let queue = DurableQueue::open(dir.path(), 100).unwrap();
            queue.enqueue(screenshot(1)).await;
            queue.enqueue(app_log("Editor")).await;
            queue
                .enqueue(QueuedRecord::TimeLog(TimeLogMutation::Insert {
                    entry: TimeLogEntry::open("u1", "t1", Utc::now()),
                }))
                .await;
        }

        assert!(dir.path().join(UNSYNCED_FILE).exists());
        assert!(dir.path().join(UNSYNCED_APP_LOGS_FILE).exists());

        let reopened = DurableQueue::open(dir.path(), 100).unwrap();
        assert_eq!(
            reopened.counts().await,
            QueueCounts {
                time_logs: 1,
                screenshots: 1,
                app_logs: 1,
            }
        );
    }

    #[tokio::test]
    async fn app_logs_file_is_a_plain_array() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), 100).unwrap();

        queue.enqueue(app_log("Browser")).await;

        let raw: Value =
            serde_json::from_slice(&fs::read(dir.path().join(UNSYNCED_APP_LOGS_FILE)).unwrap())
                .unwrap();
        assert!(raw.is_array());
        assert_eq!(raw[0]["payload"]["app_name"], "Browser");
    }

    #[tokio::test]
    async fn flush_keeps_items_while_remote_is_down() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), 100).unwrap();
        let store = MemoryStore::new();
        store.set_available(false);

        queue.enqueue(screenshot(1)).await;
        queue.enqueue(screenshot(2)).await;

        let report = queue.flush(&store).await;

        assert_eq!(
            report,
            FlushReport {
                delivered: 0,
                remaining: 2,
            }
        );
        assert_eq!(store.attempts(), 2);
    }

    #[tokio::test]
    async fn flush_delivers_and_removes_each_item_once() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), 100).unwrap();
        let store = MemoryStore::new();

        queue.enqueue(screenshot(1)).await;
        queue.enqueue(app_log("Terminal")).await;

        let first = queue.flush(&store).await;
        let second = queue.flush(&store).await;

        assert_eq!(first.delivered, 2);
        assert_eq!(first.remaining, 0);
        assert_eq!(second, FlushReport::default());
        assert_eq!(store.rows("screenshots").len(), 1);
        assert_eq!(store.rows("app_logs").len(), 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn time_log_replay_stops_at_first_failure() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), 100).unwrap();
        let store = RejectsUpdates(MemoryStore::new());
        let entry = TimeLogEntry::open("u1", "t1", Utc::now());

        queue
            .enqueue(QueuedRecord::TimeLog(TimeLogMutation::Insert {
                entry: entry.clone(),
            }))
            .await;
        queue
            .enqueue(QueuedRecord::TimeLog(TimeLogMutation::Update {
                id: entry.id.clone(),
                patch: TimeLogPatch::idle(true),
            }))
            .await;
        queue
            .enqueue(QueuedRecord::TimeLog(TimeLogMutation::Update {
                id: entry.id.clone(),
                patch: TimeLogPatch::completed(Utc::now()),
            }))
            .await;
        queue.enqueue(screenshot(1)).await;

        let report = queue.flush(&store).await;

        // The insert and the screenshot go through; both updates stay, in order.
        assert_eq!(report.delivered, 2);
        assert_eq!(report.remaining, 2);
        assert_eq!(store.0.rows(TIME_LOGS_TABLE).len(), 1);

        let pending = queue.time_logs().await;
        assert!(matches!(
            pending[0].payload,
            TimeLogMutation::Update { ref patch, .. } if patch.is_idle == Some(true)
        ));
        assert!(matches!(
            pending[1].payload,
            TimeLogMutation::Update { ref patch, .. } if patch.end_time.is_some()
        ));
    }

    #[tokio::test]
    async fn independent_items_are_retried_individually() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), 100).unwrap();
        let store = MemoryStore::new();

        queue.enqueue(app_log("A")).await;
        queue.enqueue(app_log("B")).await;
        store.set_available(false);
        queue.flush(&store).await;
        store.set_available(true);

        let report = queue.flush(&store).await;
        assert_eq!(report.delivered, 2);
        let names: Vec<Value> = store
            .rows("app_logs")
            .into_iter()
            .map(|row| row["app_name"].clone())
            .collect();
        assert_eq!(names, vec![Value::from("A"), Value::from("B")]);
    }

    #[tokio::test]
    async fn concurrent_flush_waits_and_reports() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), 100).unwrap();
        let store = MemoryStore::new();
        queue.enqueue(screenshot(1)).await;

        let held = queue.flush_lock.lock().await;
        let waiting = queue.flush(&store);
        tokio::pin!(waiting);
        assert!(
            futures::poll!(waiting.as_mut()).is_pending(),
            "flush must wait for the one in progress"
        );
        assert_eq!(store.attempts(), 0);

        drop(held);
        let report = waiting.await;

        assert_eq!(
            report,
            FlushReport {
                delivered: 1,
                remaining: 0,
            }
        );
    }

    #[tokio::test]
    async fn queued_time_log_insert_is_visible_until_delivered() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), 100).unwrap();
        let store = MemoryStore::new();
        let entry = TimeLogEntry::open("u1", "t1", Utc::now());
        let id = entry.id.clone();

        queue
            .enqueue(QueuedRecord::TimeLog(TimeLogMutation::Insert { entry }))
            .await;
        queue
            .enqueue(QueuedRecord::TimeLog(TimeLogMutation::Update {
                id: "other".to_string(),
                patch: TimeLogPatch::idle(true),
            }))
            .await;

        assert!(queue.has_time_log_insert(&id).await);
        assert!(!queue.has_time_log_insert("other").await);

        queue.flush(&store).await;
        assert!(!queue.has_time_log_insert(&id).await);
    }

    #[tokio::test]
    async fn backlog_beyond_threshold_is_kept() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(dir.path(), 2).unwrap();

        for n in 0..5 {
            queue.enqueue(screenshot(n)).await;
        }

        assert_eq!(queue.len().await, 5);
    }

    #[tokio::test]
    async fn corrupt_queue_file_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(UNSYNCED_FILE), b"{ truncated").unwrap();

        let queue = DurableQueue::open(dir.path(), 100).unwrap();

        assert!(queue.is_empty().await);
        assert!(!dir.path().join(UNSYNCED_FILE).exists());
        let quarantined = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|e| e.file_name().to_string_lossy().starts_with("unsynced.json.corrupt-"));
        assert!(quarantined);
    }

    #[test]
    fn queue_error_display() {
        let err = QueueError::Directory {
            path: PathBuf::from("/readonly/timeflow"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(
            err.to_string(),
            "failed to prepare queue directory /readonly/timeflow: denied"
        );
    }
}
