//! Tracking coordinator.
//!
//! The [`Coordinator`] owns the tracking lifecycle:
//!
//! ```text
//! Stopped --start--> Starting --time log insert attempted--> Tracking(Active)
//! Tracking(Active) <--idle edges--> Tracking(Idle)
//! Tracking(*) --stop / suspend / shutdown--> Stopped
//! ```
//!
//! While tracking, four tasks run: the screenshot loop, the foreground-app
//! loop, the idle monitor (plus the task applying its transitions), and the
//! periodic queue flush. Stopping cancels all of them and waits for them to
//! wind down before the closing time-log update is submitted.
//!
//! # Architecture
//!
//! - Start, stop, power events, and resume decisions are serialized by one
//!   async lifecycle lock, so a stop followed by a start never overlaps.
//! - Ids, the phase, the current session, and the open time log live in one
//!   synchronous mutex that is never held across an await.
//! - Idle state has a single writer, the idle monitor, and is read by the
//!   capture loops through a watch channel.
//! - The durable queue guards its own lists.
//!
//! Nothing here returns an error to the caller. Remote failures are queued,
//! capability failures are logged by the loops, and local persistence
//! failures are logged by the session store and queue.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::{
    Cadence, CaptureContext, CaptureLoop, ForegroundAppSource, FrameSource, ScreenshotSource,
    WindowSource,
};
use crate::config::Config;
use crate::idle::{CursorSource, IdleMonitor, IdleSettings};
use crate::queue::{DurableQueue, FlushReport, QueueError};
use crate::remote::RemoteStore;
use crate::session::SessionStore;
use crate::sync::{spawn_flush_loop, Delivery, SyncSink};
use crate::types::{
    QueuedRecord, TimeLogEntry, TimeLogMutation, TimeLogPatch, TrackingSession,
};

/// Whether the tracked user is currently interacting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Active,
    Idle,
}

/// Lifecycle phase of the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "activity", rename_all = "snake_case")]
pub enum TrackingState {
    #[default]
    Stopped,
    Starting,
    Tracking(Activity),
}

impl TrackingState {
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        matches!(self, Self::Tracking(_))
    }
}

/// Power-state notifications from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerEvent {
    Suspend,
    Resume,
    Shutdown,
}

/// The user's answer to the resume prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeDecision {
    Resume,
    Discard,
}

/// Platform capabilities used while tracking.
#[derive(Clone)]
pub struct Capabilities {
    pub frames: Arc<dyn FrameSource>,
    pub windows: Arc<dyn WindowSource>,
    pub cursor: Arc<dyn CursorSource>,
}

/// Timing and storage settings for a tracking run.
#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub screenshot_cadence: Cadence,
    pub app_interval: Duration,
    pub idle: IdleSettings,
    pub flush_interval: Duration,
    pub capture_dir: PathBuf,
}

impl TrackingSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            screenshot_cadence: Cadence {
                interval: config.screenshot_interval,
                jitter: config.screenshot_jitter,
            },
            app_interval: config.app_interval,
            idle: IdleSettings {
                poll_interval: config.idle_poll_interval,
                idle_timeout: config.idle_timeout,
            },
            flush_interval: config.flush_interval,
            capture_dir: config.capture_dir(),
        }
    }
}

#[derive(Clone, Copy)]
enum Halt {
    /// Close the time log and clear the saved session.
    Complete,
    /// Keep the saved session so it can be resumed.
    Suspend,
}

/// Tasks belonging to one tracking run.
struct Run {
    cancel: CancellationToken,
    idle: IdleMonitor,
    captures: Vec<CaptureLoop>,
    tasks: Vec<JoinHandle<()>>,
}

impl Run {
    async fn shutdown(self) {
        self.cancel.cancel();

        self.idle.stop().await;
        join_all(self.captures.into_iter().map(CaptureLoop::stop)).await;
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Tracking task ended abnormally");
            }
        }
    }
}

#[derive(Default)]
struct Shared {
    user_id: Option<String>,
    task_id: Option<String>,
    phase: TrackingState,
    session: Option<TrackingSession>,
    time_log: Option<TimeLogEntry>,
    pending_resume: Option<TrackingSession>,
}

struct Inner {
    settings: TrackingSettings,
    capabilities: Capabilities,
    sink: SyncSink,
    sessions: SessionStore,
    run: tokio::sync::Mutex<Option<Run>>,
    shared: Mutex<Shared>,
}

/// Orchestrates capture, idle detection, and sync for one agent process.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Creates a stopped coordinator.
    ///
    /// If a session was left on disk by a previous run, its ids are loaded and
    /// it is held as a pending resume. Tracking does not restart until
    /// [`resolve_resume`](Self::resolve_resume) is called.
    pub fn new(
        settings: TrackingSettings,
        capabilities: Capabilities,
        sink: SyncSink,
        sessions: SessionStore,
    ) -> Self {
        let mut shared = Shared::default();

        if let Some(saved) = sessions.load() {
            info!(
                session_id = %saved.session_id,
                user_id = %saved.user_id,
                task_id = %saved.task_id,
                "Found session from a previous run, waiting for resume decision"
            );
            shared.user_id = Some(saved.user_id.clone());
            shared.task_id = Some(saved.task_id.clone());
            shared.pending_resume = Some(saved);
        }

        Self {
            inner: Arc::new(Inner {
                settings,
                capabilities,
                sink,
                sessions,
                run: tokio::sync::Mutex::new(None),
                shared: Mutex::new(shared),
            }),
        }
    }

    /// Assembles a coordinator from `config`, storing its files in the data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be prepared.
    pub fn open(
        config: &Config,
        remote: Arc<dyn RemoteStore>,
        capabilities: Capabilities,
    ) -> Result<Self, QueueError> {
        let queue = Arc::new(DurableQueue::open(&config.data_dir, config.queue_warn_threshold)?);
        Ok(Self::new(
            TrackingSettings::from_config(config),
            capabilities,
            SyncSink::new(remote, queue),
            SessionStore::new(&config.data_dir),
        ))
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the user for the next tracking run.
    pub fn set_user_id(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        debug!(user_id = %user_id, "User id set");
        self.shared().user_id = Some(user_id);
    }

    /// Sets the task for the next tracking run.
    pub fn set_task_id(&self, task_id: impl Into<String>) {
        let task_id = task_id.into();
        debug!(task_id = %task_id, "Task id set");
        self.shared().task_id = Some(task_id);
    }

    #[must_use]
    pub fn state(&self) -> TrackingState {
        self.shared().phase
    }

    #[must_use]
    pub fn current_session(&self) -> Option<TrackingSession> {
        self.shared().session.clone()
    }

    /// The time log of the current run as last written locally.
    #[must_use]
    pub fn current_time_log(&self) -> Option<TimeLogEntry> {
        self.shared().time_log.clone()
    }

    /// The saved session awaiting a resume decision, if any.
    #[must_use]
    pub fn pending_resume(&self) -> Option<TrackingSession> {
        self.shared().pending_resume.clone()
    }

    /// The queue records fall back to.
    #[must_use]
    pub fn queue(&self) -> &Arc<DurableQueue> {
        self.inner.sink.queue()
    }

    /// Starts tracking with the configured user and task.
    ///
    /// Does nothing if either id is missing or tracking is already running.
    /// Returns the resulting state.
    pub async fn start_tracking(&self) -> TrackingState {
        let mut run = self.inner.run.lock().await;
        self.begin(&mut run).await
    }

    /// Stops tracking, closes the time log, and clears the saved session.
    pub async fn stop_tracking(&self) -> TrackingState {
        let mut run = self.inner.run.lock().await;
        self.halt(&mut run, Halt::Complete).await
    }

    /// Reacts to a power-state change.
    ///
    /// Suspend and shutdown stop tracking at once, leaving the time log open
    /// and the session on disk. Resume returns the saved session when there is
    /// one, which the host should offer to resume or discard.
    pub async fn handle_power_event(&self, event: PowerEvent) -> Option<TrackingSession> {
        let mut run = self.inner.run.lock().await;

        match event {
            PowerEvent::Suspend | PowerEvent::Shutdown => {
                if run.is_some() {
                    info!(event = ?event, "Power event, halting tracking");
                    self.halt(&mut run, Halt::Suspend).await;
                }
                None
            }
            PowerEvent::Resume => {
                if run.is_some() {
                    return None;
                }
                let saved = self.inner.sessions.load()?;
                info!(
                    session_id = %saved.session_id,
                    "Saved session found after resume, waiting for decision"
                );
                self.shared().pending_resume = Some(saved.clone());
                Some(saved)
            }
        }
    }

    /// Applies the user's answer to the resume prompt.
    ///
    /// Resuming starts a new run with the saved user and task, which creates
    /// a new time log. The saved run's time log is left as it was. Discarding
    /// deletes the saved session. Ignored while tracking.
    pub async fn resolve_resume(&self, decision: ResumeDecision) -> TrackingState {
        let mut run = self.inner.run.lock().await;
        if run.is_some() {
            warn!(decision = ?decision, "Resume decision ignored while tracking");
            return self.state();
        }

        let pending = self.shared().pending_resume.take();
        let Some(saved) = pending.or_else(|| self.inner.sessions.load()) else {
            debug!("No saved session awaiting a decision");
            return self.state();
        };

        match decision {
            ResumeDecision::Resume => {
                info!(
                    user_id = %saved.user_id,
                    task_id = %saved.task_id,
                    "Resuming saved session"
                );
                {
                    let mut shared = self.shared();
                    shared.user_id = Some(saved.user_id);
                    shared.task_id = Some(saved.task_id);
                }
                self.begin(&mut run).await
            }
            ResumeDecision::Discard => {
                self.inner.sessions.clear();
                info!(session_id = %saved.session_id, "Saved session discarded");
                self.state()
            }
        }
    }

    /// Flushes the durable queue now.
    ///
    /// If the flush delivered the insert of the running time log, the saved
    /// session is updated with its id.
    pub async fn sync_offline_data(&self) -> FlushReport {
        let report = self.inner.sink.flush().await;
        self.confirm_time_log().await;
        report
    }

    /// Records the running time log's id in the saved session once its
    /// insert has left the queue.
    async fn confirm_time_log(&self) {
        let entry_id = {
            let shared = self.shared();
            match (&shared.session, &shared.time_log) {
                (Some(session), Some(entry)) if session.time_log_id.is_none() => entry.id.clone(),
                _ => return,
            }
        };

        if self.queue().has_time_log_insert(&entry_id).await {
            return;
        }

        // Saved under the lock so a concurrent stop cannot be undone.
        let mut shared = self.shared();
        let still_running = shared
            .time_log
            .as_ref()
            .is_some_and(|entry| entry.id == entry_id);
        if let (true, Some(session)) = (still_running, shared.session.as_mut()) {
            session.time_log_id = Some(entry_id);
            self.inner.sessions.save(session);
            info!(
                session_id = %session.session_id,
                time_log_id = ?session.time_log_id,
                "Time log confirmed, session updated"
            );
        }
    }

    /// Reads the saved session from disk.
    #[must_use]
    pub fn load_session(&self) -> Option<TrackingSession> {
        self.inner.sessions.load()
    }

    /// Deletes the saved session and forgets any pending resume.
    pub fn clear_session(&self) {
        self.inner.sessions.clear();
        self.shared().pending_resume = None;
    }

    async fn begin(&self, run: &mut Option<Run>) -> TrackingState {
        let (user_id, task_id) = {
            let mut shared = self.shared();
            if shared.phase != TrackingState::Stopped {
                debug!(state = ?shared.phase, "Start ignored, already tracking");
                return shared.phase;
            }
            match (non_blank(&shared.user_id), non_blank(&shared.task_id)) {
                (Some(user_id), Some(task_id)) => {
                    shared.phase = TrackingState::Starting;
                    shared.pending_resume = None;
                    (user_id, task_id)
                }
                _ => {
                    warn!("Cannot start tracking without both a user id and a task id");
                    return TrackingState::Stopped;
                }
            }
        };

        let start_time = Utc::now();
        let entry = TimeLogEntry::open(&user_id, &task_id, start_time);
        info!(
            user_id = %user_id,
            task_id = %task_id,
            time_log_id = %entry.id,
            "Starting tracking"
        );

        let delivery = self
            .inner
            .sink
            .submit(QueuedRecord::TimeLog(TimeLogMutation::Insert {
                entry: entry.clone(),
            }))
            .await;

        let session = TrackingSession {
            session_id: Uuid::new_v4(),
            user_id: user_id.clone(),
            task_id: task_id.clone(),
            start_time,
            time_log_id: (delivery == Delivery::Delivered).then(|| entry.id.clone()),
            end_time: None,
        };
        self.inner.sessions.save(&session);

        let context = CaptureContext {
            user_id,
            task_id,
            time_log_id: entry.id.clone(),
        };

        let phase = {
            let mut shared = self.shared();
            shared.phase = TrackingState::Tracking(Activity::Active);
            shared.session = Some(session);
            shared.time_log = Some(entry);
            shared.phase
        };

        *run = Some(self.spawn_run(context));
        phase
    }

    fn spawn_run(&self, context: CaptureContext) -> Run {
        let settings = &self.inner.settings;
        let capabilities = &self.inner.capabilities;
        let sink = &self.inner.sink;
        let cancel = CancellationToken::new();

        let (transitions_tx, transitions_rx) = mpsc::unbounded_channel();
        let idle = IdleMonitor::start(
            capabilities.cursor.clone(),
            settings.idle,
            transitions_tx,
            cancel.child_token(),
        );

        let captures = vec![
            CaptureLoop::start(
                ScreenshotSource::new(
                    capabilities.frames.clone(),
                    settings.capture_dir.clone(),
                    context.clone(),
                ),
                settings.screenshot_cadence,
                idle.subscribe(),
                sink.clone(),
                cancel.child_token(),
            ),
            CaptureLoop::start(
                ForegroundAppSource::new(capabilities.windows.clone(), context),
                Cadence::fixed(settings.app_interval),
                idle.subscribe(),
                sink.clone(),
                cancel.child_token(),
            ),
        ];

        let tasks = vec![
            tokio::spawn(
                self.clone()
                    .apply_idle_transitions(transitions_rx, cancel.child_token()),
            ),
            spawn_flush_loop(settings.flush_interval, cancel.child_token(), {
                let this = self.clone();
                move || {
                    let this = this.clone();
                    async move { this.sync_offline_data().await }
                }
            }),
        ];

        Run {
            cancel,
            idle,
            captures,
            tasks,
        }
    }

    async fn apply_idle_transitions(
        self,
        mut transitions: mpsc::UnboundedReceiver<bool>,
        cancel: CancellationToken,
    ) {
        loop {
            let is_idle = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = transitions.recv() => match next {
                    Some(is_idle) => is_idle,
                    None => break,
                },
            };
            self.on_idle_changed(is_idle, &cancel).await;
        }
    }

    async fn on_idle_changed(&self, is_idle: bool, cancel: &CancellationToken) {
        let (id, patch) = {
            let mut shared = self.shared();
            if !shared.phase.is_tracking() {
                return;
            }
            let Some(entry) = shared.time_log.as_mut() else {
                return;
            };
            let patch = TimeLogPatch::idle(is_idle);
            entry.apply(&patch);
            let id = entry.id.clone();

            shared.phase = TrackingState::Tracking(if is_idle {
                Activity::Idle
            } else {
                Activity::Active
            });
            (id, patch)
        };

        info!(time_log_id = %id, is_idle, "Recording idle transition");
        self.inner
            .sink
            .submit_until(
                QueuedRecord::TimeLog(TimeLogMutation::Update { id, patch }),
                cancel,
            )
            .await;
    }

    async fn halt(&self, run: &mut Option<Run>, mode: Halt) -> TrackingState {
        let Some(active) = run.take() else {
            debug!("Stop ignored, not tracking");
            return self.state();
        };

        active.shutdown().await;

        let (session, time_log) = {
            let mut shared = self.shared();
            shared.phase = TrackingState::Stopped;
            (shared.session.take(), shared.time_log.take())
        };

        match mode {
            Halt::Complete => {
                if let Some(entry) = time_log {
                    self.inner
                        .sink
                        .submit(QueuedRecord::TimeLog(TimeLogMutation::Update {
                            id: entry.id,
                            patch: TimeLogPatch::completed(Utc::now()),
                        }))
                        .await;
                }
                self.inner.sessions.clear();
                info!("Tracking stopped");
            }
            Halt::Suspend => {
                info!(
                    session_id = ?session.map(|s| s.session_id),
                    "Tracking halted, session kept for resume"
                );
            }
        }

        TrackingState::Stopped
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_state_serializes_with_activity() {
        assert_eq!(
            serde_json::to_value(TrackingState::Tracking(Activity::Idle)).unwrap(),
            serde_json::json!({ "state": "tracking", "activity": "idle" })
        );
        assert_eq!(
            serde_json::to_value(TrackingState::Stopped).unwrap(),
            serde_json::json!({ "state": "stopped" })
        );
    }

    #[test]
    fn default_state_is_stopped() {
        assert_eq!(TrackingState::default(), TrackingState::Stopped);
        assert!(!TrackingState::Starting.is_tracking());
        assert!(TrackingState::Tracking(Activity::Active).is_tracking());
    }

    #[test]
    fn non_blank_rejects_empty_ids() {
        assert_eq!(non_blank(&None), None);
        assert_eq!(non_blank(&Some("   ".to_string())), None);
        assert_eq!(non_blank(&Some(" u1 ".to_string())), Some("u1".to_string()));
    }

    fn config(data_dir: PathBuf) -> Config {
        Config {
            remote: None,
            data_dir,
            screenshot_interval: Duration::from_secs(540),
            screenshot_jitter: Duration::from_secs(360),
            app_interval: Duration::from_secs(10),
            idle_poll_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            flush_interval: Duration::from_secs(30),
            queue_warn_threshold: 1000,
            screenshot_command: None,
            window_command: None,
            cursor_command: None,
        }
    }

    #[test]
    fn settings_follow_config_intervals() {
        let config = config(PathBuf::from("/tmp/timeflow"));

        let settings = TrackingSettings::from_config(&config);

        assert_eq!(settings.screenshot_cadence.jitter, Duration::from_secs(360));
        assert_eq!(settings.idle.idle_timeout, Duration::from_secs(300));
        assert_eq!(settings.capture_dir, PathBuf::from("/tmp/timeflow/captures"));
    }

    #[test]
    fn open_reports_unusable_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let config = config(blocker.join("agent"));

        let result = Coordinator::open(
            &config,
            Arc::new(crate::remote::MemoryStore::new()),
            crate::platform::capabilities_from_config(&config),
        );

        assert!(matches!(result, Err(QueueError::Directory { .. })));
    }
}
