//! Periodic capture sources.
//!
//! A capture source produces one kind of telemetry on its own cadence. The
//! sources in this module are:
//!
//! - [`screenshot`]: grabs a frame, stores it under `captures/`, and emits its metadata
//! - [`app`]: watches the foreground window and emits one app log per window span
//!
//! Each source is driven by a [`CaptureLoop`], which owns the timer, skips
//! ticks while the user is idle, and hands every artifact to the
//! [`SyncSink`]. A tick that fails is logged and skipped; the next tick tries
//! again.
//!
//! # Architecture
//!
//! Ticks run one at a time inside a single task. The next delay starts only
//! once the current tick, including its delivery, has finished, so slow I/O
//! stretches the cadence instead of piling up concurrent captures.

pub mod app;
pub mod screenshot;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::sync::SyncSink;
use crate::types::{CaptureArtifact, IdleState};

pub use app::{ActiveWindow, ForegroundAppSource, WindowSource};
pub use screenshot::{FrameSource, ScreenshotSource};

/// Errors raised by platform capabilities and capture sources.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The capability is not available on this platform or not configured.
    #[error("capability unsupported: {0}")]
    Unsupported(String),

    /// The operating system refused access.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The capability ran but produced nothing usable.
    #[error("no data from {0}")]
    NoData(String),

    /// The capability failed.
    #[error("capture failed: {0}")]
    Failed(String),

    /// Local file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identifies the session every artifact is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureContext {
    pub user_id: String,
    pub task_id: String,
    pub time_log_id: String,
}

/// A producer of capture artifacts.
#[async_trait]
pub trait CaptureSource: Send + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Performs one capture. An empty result is a valid, quiet tick.
    async fn capture(&mut self) -> Result<Vec<CaptureArtifact>, CaptureError>;

    /// Closes any artifact in progress when the user goes idle.
    ///
    /// `idle_since` is the time of the last user input. Ticks resume with a
    /// fresh artifact once the user is active again.
    fn pause(&mut self, _idle_since: DateTime<Utc>) -> Vec<CaptureArtifact> {
        Vec::new()
    }

    /// Flushes any artifact still in progress when the source stops.
    fn finish(&mut self) -> Vec<CaptureArtifact> {
        Vec::new()
    }
}

/// Delay between ticks, optionally randomised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub interval: Duration,
    pub jitter: Duration,
}

impl Cadence {
    /// A cadence without jitter.
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            jitter: Duration::ZERO,
        }
    }

    /// Picks the next delay uniformly in `interval ± jitter`, never below one second.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }

        let low = millis(self.interval.saturating_sub(self.jitter));
        let high = millis(self.interval.saturating_add(self.jitter));
        let millis = rand::rng().random_range(low..=high);
        Duration::from_millis(millis).max(Duration::from_secs(1))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A running capture source.
#[derive(Debug)]
pub struct CaptureLoop {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CaptureLoop {
    /// Starts ticking `source` on `cadence`.
    ///
    /// Ticks are skipped while `idle` reports the user as idle. The first
    /// skipped tick calls [`CaptureSource::pause`] and submits what it
    /// returns. Artifacts are
    /// submitted through `sink`. When `cancel` fires, any in-flight delivery is
    /// abandoned to the queue and whatever [`CaptureSource::finish`] returns is
    /// queued directly.
    pub fn start<S: CaptureSource>(
        source: S,
        cadence: Cadence,
        idle: watch::Receiver<IdleState>,
        sink: SyncSink,
        cancel: CancellationToken,
    ) -> Self {
        let name = source.name();
        let handle = tokio::spawn(run(source, cadence, idle, sink, cancel.clone()));
        debug!(source = name, interval = ?cadence.interval, "Capture loop started");

        Self {
            name,
            cancel,
            handle,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cancels the loop and waits for it to finish its shutdown work.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(source = self.name, error = %e, "Capture task ended abnormally");
        }
    }
}

async fn run<S: CaptureSource>(
    mut source: S,
    cadence: Cadence,
    idle: watch::Receiver<IdleState>,
    sink: SyncSink,
    cancel: CancellationToken,
) {
    let name = source.name();
    let mut paused = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(cadence.next_delay()) => {}
        }

        let idle_since = {
            let state = idle.borrow();
            state.is_idle.then_some(state.last_input_at)
        };
        if let Some(idle_since) = idle_since {
            if !paused {
                paused = true;
                debug!(source = name, %idle_since, "User idle, pausing capture");
                for artifact in source.pause(idle_since) {
                    sink.submit_until(artifact.into(), &cancel).await;
                }
            }
            trace!(source = name, "User idle, skipping capture");
            continue;
        }
        paused = false;

        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = source.capture() => result,
        };

        match result {
            Ok(artifacts) => {
                for artifact in artifacts {
                    sink.submit_until(artifact.into(), &cancel).await;
                }
            }
            Err(e) => warn!(source = name, error = %e, "Capture failed, skipping tick"),
        }
    }

    for artifact in source.finish() {
        sink.queue().enqueue(artifact.into()).await;
    }

    debug!(source = name, "Capture loop stopped");
}
