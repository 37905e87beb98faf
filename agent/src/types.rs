//! Data model shared by the capture, sync and session layers.
//!
//! Every record the agent produces while tracking is one of the types in this
//! module. They serialize to the exact row shapes stored remotely (`time_logs`,
//! `screenshots`, `app_logs`) and to the on-disk queue files, so field names are
//! part of the persistence contract.
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use timeflow_agent::types::{QueueKind, QueuedRecord, TimeLogEntry, TimeLogMutation};
//!
//! let entry = TimeLogEntry::open("user-1", "task-9", Utc::now());
//! let record = QueuedRecord::TimeLog(TimeLogMutation::Insert { entry });
//! assert_eq!(record.kind(), QueueKind::TimeLog);
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Remote table holding one row per tracking session.
pub const TIME_LOGS_TABLE: &str = "time_logs";

/// Remote table holding screenshot metadata rows.
pub const SCREENSHOTS_TABLE: &str = "screenshots";

/// Remote table holding foreground application segments.
pub const APP_LOGS_TABLE: &str = "app_logs";

/// Storage bucket screenshot images are uploaded to.
pub const SCREENSHOT_BUCKET: &str = "screenshots";

/// Status column of a time log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeLogStatus {
    /// The user is tracking and interacting.
    Active,
    /// The user is tracking but has been inactive past the idle timeout.
    Idle,
    /// Tracking was stopped cleanly.
    Completed,
}

/// The single tracking session owned by an agent process.
///
/// Persisted to `session.json` while tracking so a crash or power event can be
/// offered for resumption on the next start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingSession {
    /// Local identifier for this session.
    #[serde(default = "Uuid::new_v4")]
    pub session_id: Uuid,

    /// User the session is tracked for.
    pub user_id: String,

    /// Task the session is tracked against.
    pub task_id: String,

    /// When tracking started.
    pub start_time: DateTime<Utc>,

    /// Remote time log id, `None` until the insert has been confirmed.
    #[serde(default)]
    pub time_log_id: Option<String>,

    /// Set when the session ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// A `time_logs` row.
///
/// The id is generated locally so that queued updates can reference a row whose
/// insert has not reached the remote store yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLogEntry {
    pub id: String,
    pub user_id: String,
    pub task_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub is_idle: bool,
    pub status: TimeLogStatus,
}

impl TimeLogEntry {
    /// Creates an active entry starting at `start_time` with a fresh id.
    #[must_use]
    pub fn open(
        user_id: impl Into<String>,
        task_id: impl Into<String>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            task_id: task_id.into(),
            start_time,
            end_time: None,
            is_idle: false,
            status: TimeLogStatus::Active,
        }
    }

    /// Applies the fields present in `patch` to this entry.
    pub fn apply(&mut self, patch: &TimeLogPatch) {
        if let Some(end_time) = patch.end_time {
            self.end_time = Some(end_time);
        }
        if let Some(is_idle) = patch.is_idle {
            self.is_idle = is_idle;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
    }

    /// Returns `true` while the entry has no end time.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// A partial update to a `time_logs` row. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLogPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_idle: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TimeLogStatus>,
}

impl TimeLogPatch {
    /// Patch recording an idle transition.
    #[must_use]
    pub fn idle(is_idle: bool) -> Self {
        Self {
            end_time: None,
            is_idle: Some(is_idle),
            status: Some(if is_idle {
                TimeLogStatus::Idle
            } else {
                TimeLogStatus::Active
            }),
        }
    }

    /// Patch closing the entry at `end_time`.
    #[must_use]
    pub fn completed(end_time: DateTime<Utc>) -> Self {
        Self {
            end_time: Some(end_time),
            is_idle: None,
            status: Some(TimeLogStatus::Completed),
        }
    }
}

/// A write against the `time_logs` table.
///
/// Mutations for the same entry must reach the remote store in the order they
/// were produced, so they share one ordered queue lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TimeLogMutation {
    Insert { entry: TimeLogEntry },
    Update { id: String, patch: TimeLogPatch },
}

impl TimeLogMutation {
    /// Id of the entry this mutation targets.
    #[must_use]
    pub fn entry_id(&self) -> &str {
        match self {
            Self::Insert { entry } => &entry.id,
            Self::Update { id, .. } => id,
        }
    }
}

/// Metadata for one captured screenshot.
///
/// While queued, `local_path` points at the image on disk and `image_url` is
/// empty. The URL is filled in once the upload succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotMeta {
    pub user_id: String,
    pub task_id: String,
    #[serde(default)]
    pub time_log_id: Option<String>,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl ScreenshotMeta {
    /// Builds the `screenshots` row for this capture.
    #[must_use]
    pub fn row(&self) -> Value {
        json!({
            "user_id": self.user_id,
            "task_id": self.task_id,
            "time_log_id": self.time_log_id,
            "image_url": self.image_url,
            "captured_at": self.captured_at,
        })
    }

    /// Object path inside the screenshot bucket: `{user_id}/{file name}`.
    #[must_use]
    pub fn object_path(&self) -> Option<String> {
        let file_name = self.local_path.as_ref()?.file_name()?.to_str()?;
        Some(format!("{}/{}", self.user_id, file_name))
    }
}

/// An `app_logs` row: one contiguous span with the same foreground window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLogEntry {
    pub user_id: String,
    pub task_id: String,
    #[serde(default)]
    pub time_log_id: Option<String>,
    pub app_name: String,
    pub window_title: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
}

/// Snapshot of the idle detector's view of the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdleState {
    pub is_idle: bool,
    pub last_input_at: DateTime<Utc>,
}

impl IdleState {
    /// An active state whose last input is `now`.
    #[must_use]
    pub fn active(now: DateTime<Utc>) -> Self {
        Self {
            is_idle: false,
            last_input_at: now,
        }
    }
}

/// Lane of the durable queue a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    TimeLog,
    Screenshot,
    AppLog,
}

/// A record waiting in the durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem<T> {
    pub id: Uuid,
    pub kind: QueueKind,
    pub payload: T,
    pub enqueued_at: DateTime<Utc>,
}

impl<T> QueueItem<T> {
    /// Wraps `payload` with a fresh id stamped at the current time.
    #[must_use]
    pub fn new(kind: QueueKind, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// Any record the agent delivers to the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedRecord {
    TimeLog(TimeLogMutation),
    Screenshot(ScreenshotMeta),
    AppLog(AppLogEntry),
}

impl QueuedRecord {
    #[must_use]
    pub fn kind(&self) -> QueueKind {
        match self {
            Self::TimeLog(_) => QueueKind::TimeLog,
            Self::Screenshot(_) => QueueKind::Screenshot,
            Self::AppLog(_) => QueueKind::AppLog,
        }
    }
}

/// Output of a capture source tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureArtifact {
    Screenshot(ScreenshotMeta),
    AppLog(AppLogEntry),
}

impl From<CaptureArtifact> for QueuedRecord {
    fn from(artifact: CaptureArtifact) -> Self {
        match artifact {
            CaptureArtifact::Screenshot(meta) => Self::Screenshot(meta),
            CaptureArtifact::AppLog(entry) => Self::AppLog(entry),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap()
    }

    #[test]
    fn open_entry_is_active_and_not_idle() {
        let entry = TimeLogEntry::open("u1", "t1", fixed_time());

        assert_eq!(entry.status, TimeLogStatus::Active);
        assert!(!entry.is_idle);
        assert!(entry.is_open());
        assert!(Uuid::parse_str(&entry.id).is_ok());
    }

    #[test]
    fn open_entries_get_distinct_ids() {
        let a = TimeLogEntry::open("u1", "t1", fixed_time());
        let b = TimeLogEntry::open("u1", "t1", fixed_time());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn idle_patch_sets_status_and_flag() {
        let mut entry = TimeLogEntry::open("u1", "t1", fixed_time());

        entry.apply(&TimeLogPatch::idle(true));
        assert!(entry.is_idle);
        assert_eq!(entry.status, TimeLogStatus::Idle);

        entry.apply(&TimeLogPatch::idle(false));
        assert!(!entry.is_idle);
        assert_eq!(entry.status, TimeLogStatus::Active);
        assert!(entry.is_open());
    }

    #[test]
    fn completed_patch_closes_entry() {
        let mut entry = TimeLogEntry::open("u1", "t1", fixed_time());
        let end = fixed_time() + chrono::Duration::minutes(42);

        entry.apply(&TimeLogPatch::completed(end));

        assert_eq!(entry.end_time, Some(end));
        assert_eq!(entry.status, TimeLogStatus::Completed);
        assert!(!entry.is_open());
    }

    #[test]
    fn idle_patch_serializes_only_present_fields() {
        let value = serde_json::to_value(TimeLogPatch::idle(true)).unwrap();
        assert_eq!(value, json!({ "is_idle": true, "status": "idle" }));
    }

    #[test]
    fn mutation_is_tagged_by_op() {
        let mutation = TimeLogMutation::Update {
            id: "abc".to_string(),
            patch: TimeLogPatch::idle(false),
        };
        let value = serde_json::to_value(&mutation).unwrap();

        assert_eq!(value["op"], "update");
        assert_eq!(value["id"], "abc");
        assert_eq!(mutation.entry_id(), "abc");
    }

    #[test]
    fn session_without_session_id_still_loads() {
        let raw = r#"{
            "user_id": "u1",
            "task_id": "t1",
            "start_time": "2026-03-14T09:30:00Z",
            "time_log_id": null
        }"#;

        let session: TrackingSession = serde_json::from_str(raw).unwrap();
        assert_eq!(session.user_id, "u1");
        assert!(session.time_log_id.is_none());
        assert!(session.end_time.is_none());
    }

    #[test]
    fn screenshot_row_omits_local_path() {
        let meta = ScreenshotMeta {
            user_id: "u1".to_string(),
            task_id: "t1".to_string(),
            time_log_id: Some("log-1".to_string()),
            captured_at: fixed_time(),
            local_path: Some(PathBuf::from("/tmp/captures/screenshot_1.png")),
            image_url: Some("https://cdn/u1/screenshot_1.png".to_string()),
        };

        let row = meta.row();
        assert!(row.get("local_path").is_none());
        assert_eq!(row["image_url"], "https://cdn/u1/screenshot_1.png");
        assert_eq!(meta.object_path().as_deref(), Some("u1/screenshot_1.png"));
    }

    #[test]
    fn screenshot_without_file_has_no_object_path() {
        let meta = ScreenshotMeta {
            user_id: "u1".to_string(),
            task_id: "t1".to_string(),
            time_log_id: None,
            captured_at: fixed_time(),
            local_path: None,
            image_url: None,
        };
        assert!(meta.object_path().is_none());
    }

    #[test]
    fn record_kind_matches_variant() {
        let app = AppLogEntry {
            user_id: "u1".to_string(),
            task_id: "t1".to_string(),
            time_log_id: None,
            app_name: "Editor".to_string(),
            window_title: "main.rs".to_string(),
            started_at: fixed_time(),
            ended_at: None,
            duration_seconds: None,
        };

        let record: QueuedRecord = CaptureArtifact::AppLog(app).into();
        assert_eq!(record.kind(), QueueKind::AppLog);
    }

    #[test]
    fn queue_item_round_trips_through_json() {
        let item = QueueItem::new(
            QueueKind::TimeLog,
            TimeLogMutation::Insert {
                entry: TimeLogEntry::open("u1", "t1", fixed_time()),
            },
        );

        let raw = serde_json::to_string(&item).unwrap();
        let back: QueueItem<TimeLogMutation> = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, item);
    }
}
