//! Persistence of the current tracking session.
//!
//! The session file exists exactly while the agent is (or was, before a crash
//! or power event) tracking. Its presence at startup is what triggers the
//! resume prompt. All operations are best-effort: failures are logged and
//! swallowed, since losing the file only costs the resume prompt.

use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::types::TrackingSession;
use crate::utils::{read_json, remove_if_exists, write_json_atomic};

/// File name of the persisted session inside the data directory.
pub const SESSION_FILE: &str = "session.json";

/// Reads and writes `session.json`.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Creates a store for `session.json` inside `dir`.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SESSION_FILE),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replaces the stored session.
    pub fn save(&self, session: &TrackingSession) {
        match write_json_atomic(&self.path, session) {
            Ok(()) => debug!(session_id = %session.session_id, "Session saved"),
            Err(e) => error!(
                path = %self.path.display(),
                error = %e,
                "Failed to save session"
            ),
        }
    }

    /// Returns the stored session, or `None` if there is none or it is unreadable.
    #[must_use]
    pub fn load(&self) -> Option<TrackingSession> {
        match read_json(&self.path) {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Ignoring unreadable session file"
                );
                None
            }
        }
    }

    /// Deletes the stored session. A missing file is not an error.
    pub fn clear(&self) {
        match remove_if_exists(&self.path) {
            Ok(()) => debug!("Session cleared"),
            Err(e) => error!(
                path = %self.path.display(),
                error = %e,
                "Failed to clear session"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn sample_session() -> TrackingSession {
        TrackingSession {
            session_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            task_id: "task-7".to_string(),
            start_time: Utc::now(),
            time_log_id: None,
            end_time: None,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let session = sample_session();

        store.save(&session);

        assert_eq!(store.load(), Some(session));
    }

    #[test]
    fn save_overwrites_previous_session() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let first = sample_session();
        let mut second = sample_session();
        second.time_log_id = Some("log-9".to_string());

        store.save(&first);
        store.save(&second);

        assert_eq!(store.load(), Some(second));
    }

    #[test]
    fn load_without_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(SessionStore::new(dir.path()).load().is_none());
    }

    #[test]
    fn corrupt_file_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        std::fs::write(store.path(), b"{\"user_id\":").unwrap();

        assert!(store.load().is_none());
    }

    #[test]
    fn clear_removes_file_and_tolerates_repeats() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        store.save(&sample_session());

        store.clear();
        store.clear();

        assert!(!store.path().exists());
        assert!(store.load().is_none());
    }

    #[test]
    fn save_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let store = SessionStore::new(&blocker);

        store.save(&sample_session());

        assert!(store.load().is_none());
    }
}
