//! Delivery of captured records to the remote store.
//!
//! [`SyncSink`] is the one place records leave the agent. Every record is
//! either confirmed by the remote store or appended to the [`DurableQueue`];
//! there is no third outcome. The periodic flush that drains the queue also
//! lives here.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use timeflow_agent::queue::DurableQueue;
//! use timeflow_agent::remote::MemoryStore;
//! use timeflow_agent::sync::{Delivery, SyncSink};
//! use timeflow_agent::types::{QueuedRecord, TimeLogEntry, TimeLogMutation};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Arc::new(DurableQueue::open("/tmp/timeflow", 1000)?);
//! let sink = SyncSink::new(Arc::new(MemoryStore::new()), queue);
//!
//! let entry = TimeLogEntry::open("user-1", "task-1", chrono::Utc::now());
//! let outcome = sink
//!     .submit(QueuedRecord::TimeLog(TimeLogMutation::Insert { entry }))
//!     .await;
//! assert_eq!(outcome, Delivery::Delivered);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::queue::{DurableQueue, FlushReport};
use crate::remote::{RemoteError, RemoteStore};
use crate::types::{
    QueueKind, QueuedRecord, ScreenshotMeta, TimeLogMutation, APP_LOGS_TABLE, SCREENSHOTS_TABLE,
    SCREENSHOT_BUCKET, TIME_LOGS_TABLE,
};

/// Errors from a single delivery attempt.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The remote store failed or rejected the write.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The captured file could not be read.
    #[error("failed to read capture: {0}")]
    Io(#[from] io::Error),

    /// The record could not be encoded.
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where a submitted record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The remote store confirmed the write.
    Delivered,
    /// The record is waiting in the durable queue.
    Queued,
}

/// Writes one record to the remote store.
///
/// Screenshots are uploaded first when they still point at a local file, then
/// their metadata row is inserted. The local file is removed only after both
/// succeed. A capture whose file has disappeared is delivered as metadata
/// without an image.
///
/// # Errors
///
/// Returns a [`DeliveryError`] if any remote call fails or the capture file
/// cannot be read.
pub async fn deliver(remote: &dyn RemoteStore, record: &QueuedRecord) -> Result<(), DeliveryError> {
    match record {
        QueuedRecord::TimeLog(TimeLogMutation::Insert { entry }) => {
            remote
                .insert(TIME_LOGS_TABLE, &serde_json::to_value(entry)?)
                .await?;
        }
        QueuedRecord::TimeLog(TimeLogMutation::Update { id, patch }) => {
            remote
                .update(TIME_LOGS_TABLE, id, &serde_json::to_value(patch)?)
                .await?;
        }
        QueuedRecord::Screenshot(meta) => deliver_screenshot(remote, meta).await?,
        QueuedRecord::AppLog(entry) => {
            remote
                .insert(APP_LOGS_TABLE, &serde_json::to_value(entry)?)
                .await?;
        }
    }
    Ok(())
}

async fn deliver_screenshot(
    remote: &dyn RemoteStore,
    meta: &ScreenshotMeta,
) -> Result<(), DeliveryError> {
    let mut meta = meta.clone();

    if meta.image_url.is_none() {
        if let (Some(path), Some(object_path)) = (meta.local_path.clone(), meta.object_path()) {
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let url = remote.upload(SCREENSHOT_BUCKET, &object_path, bytes).await?;
                    meta.image_url = Some(url);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(
                        path = %path.display(),
                        "Screenshot file missing, delivering metadata only"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    remote.insert(SCREENSHOTS_TABLE, &meta.row()).await?;

    if let Some(path) = &meta.local_path {
        if let Err(e) = crate::utils::remove_if_exists(path) {
            debug!(path = %path.display(), error = %e, "Failed to remove delivered screenshot");
        }
    }

    Ok(())
}

/// Routes records to the remote store, falling back to the durable queue.
#[derive(Clone)]
pub struct SyncSink {
    remote: Arc<dyn RemoteStore>,
    queue: Arc<DurableQueue>,
}

impl SyncSink {
    pub fn new(remote: Arc<dyn RemoteStore>, queue: Arc<DurableQueue>) -> Self {
        Self { remote, queue }
    }

    /// The queue backing this sink.
    #[must_use]
    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    /// Delivers `record`, queueing it if the remote write fails.
    pub async fn submit(&self, record: QueuedRecord) -> Delivery {
        self.submit_until(record, &CancellationToken::new()).await
    }

    /// Like [`submit`](Self::submit), but gives up on the remote call once
    /// `cancel` fires and queues the record instead.
    ///
    /// A time-log mutation is queued without a remote attempt while older
    /// time-log mutations are still waiting, so they reach the store in order.
    pub async fn submit_until(&self, record: QueuedRecord, cancel: &CancellationToken) -> Delivery {
        let kind = record.kind();

        if kind == QueueKind::TimeLog && self.queue.has_pending(QueueKind::TimeLog).await {
            debug!("Earlier time log mutations pending, queueing behind them");
            self.queue.enqueue(record).await;
            return Delivery::Queued;
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = deliver(self.remote.as_ref(), &record) => Some(result),
        };

        match outcome {
            Some(Ok(())) => {
                debug!(kind = ?kind, "Record delivered");
                Delivery::Delivered
            }
            Some(Err(e)) => {
                warn!(kind = ?kind, error = %e, "Remote write failed, queueing record");
                self.queue.enqueue(record).await;
                Delivery::Queued
            }
            None => {
                debug!(kind = ?kind, "Delivery abandoned on shutdown, queueing record");
                self.queue.enqueue(record).await;
                Delivery::Queued
            }
        }
    }

    /// Replays the durable queue against the remote store.
    pub async fn flush(&self) -> FlushReport {
        self.queue.flush(self.remote.as_ref()).await
    }
}

/// Spawns a task that runs `flush` every `period` until `cancel` fires.
///
/// `flush` is usually a closure over [`SyncSink::flush`]. The first flush
/// happens one full period after spawning. A flush still running when
/// cancellation arrives is abandoned; records it had not yet removed stay
/// queued.
pub fn spawn_flush_loop<F, Fut>(
    period: Duration,
    cancel: CancellationToken,
    mut flush: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = FlushReport> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                report = flush() => {
                    debug!(
                        delivered = report.delivered,
                        remaining = report.remaining,
                        "Periodic flush finished"
                    );
                }
            }
        }

        debug!("Flush loop stopped");
    })
}
