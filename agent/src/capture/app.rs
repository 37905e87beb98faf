//! Foreground application capture source.
//!
//! Tracks spans of time during which the same window (application name plus
//! window title) stays in the foreground. A span is closed, and emitted as an
//! [`AppLogEntry`], when a tick observes a different window, when the user goes
//! idle, or when the source stops. Idle time never counts toward a span.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{CaptureContext, CaptureError, CaptureSource};
use crate::types::{AppLogEntry, CaptureArtifact};

/// The window currently in the foreground.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub app_name: String,
    pub window_title: String,
}

/// Platform capability describing the foreground window.
#[async_trait]
pub trait WindowSource: Send + Sync {
    async fn active_window(&self) -> Result<Option<ActiveWindow>, CaptureError>;
}

#[derive(Debug, Clone)]
struct OpenSpan {
    window: ActiveWindow,
    started_at: DateTime<Utc>,
}

impl OpenSpan {
    fn close(self, context: &CaptureContext, ended_at: DateTime<Utc>) -> AppLogEntry {
        AppLogEntry {
            user_id: context.user_id.clone(),
            task_id: context.task_id.clone(),
            time_log_id: Some(context.time_log_id.clone()),
            app_name: self.window.app_name,
            window_title: self.window.window_title,
            started_at: self.started_at,
            ended_at: Some(ended_at),
            duration_seconds: Some((ended_at - self.started_at).num_seconds().max(0)),
        }
    }
}

/// Capture source producing app log entries.
pub struct ForegroundAppSource {
    windows: Arc<dyn WindowSource>,
    context: CaptureContext,
    current: Option<OpenSpan>,
}

impl ForegroundAppSource {
    pub fn new(windows: Arc<dyn WindowSource>, context: CaptureContext) -> Self {
        Self {
            windows,
            context,
            current: None,
        }
    }

    /// The window of the span currently open, if any.
    #[must_use]
    pub fn current_window(&self) -> Option<&ActiveWindow> {
        self.current.as_ref().map(|span| &span.window)
    }

    fn switch_to(&mut self, window: ActiveWindow, now: DateTime<Utc>) -> Option<AppLogEntry> {
        info!(
            app_name = %window.app_name,
            window_title = %window.window_title,
            "Foreground app changed"
        );
        let previous = self.current.replace(OpenSpan {
            window,
            started_at: now,
        });
        previous.map(|span| span.close(&self.context, now))
    }
}

#[async_trait]
impl CaptureSource for ForegroundAppSource {
    fn name(&self) -> &'static str {
        "foreground_app"
    }

    async fn capture(&mut self) -> Result<Vec<CaptureArtifact>, CaptureError> {
        let window = self
            .windows
            .active_window()
            .await?
            .filter(|w| !w.app_name.trim().is_empty())
            .ok_or_else(|| CaptureError::NoData("active window".to_string()))?;

        if self.current_window() == Some(&window) {
            return Ok(Vec::new());
        }

        Ok(self
            .switch_to(window, Utc::now())
            .map(CaptureArtifact::AppLog)
            .into_iter()
            .collect())
    }

    fn pause(&mut self, idle_since: DateTime<Utc>) -> Vec<CaptureArtifact> {
        self.current
            .take()
            .map(|span| {
                let ended_at = idle_since.max(span.started_at);
                CaptureArtifact::AppLog(span.close(&self.context, ended_at))
            })
            .into_iter()
            .collect()
    }

    fn finish(&mut self) -> Vec<CaptureArtifact> {
        self.current
            .take()
            .map(|span| CaptureArtifact::AppLog(span.close(&self.context, Utc::now())))
            .into_iter()
            .collect()
    }
}
