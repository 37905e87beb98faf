//! Screenshot capture source.
//!
//! Each tick grabs one frame from the platform [`FrameSource`], writes it to
//! the capture directory as `screenshot_<uuid>.png`, and emits a
//! [`ScreenshotMeta`] pointing at the file. The file stays on disk until the
//! sync path has uploaded it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use super::{CaptureContext, CaptureError, CaptureSource};
use crate::types::{CaptureArtifact, ScreenshotMeta};

/// Platform capability returning one encoded PNG frame of the screen.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture_frame(&self) -> Result<Vec<u8>, CaptureError>;
}

/// Capture source producing screenshot metadata.
pub struct ScreenshotSource {
    frames: Arc<dyn FrameSource>,
    capture_dir: PathBuf,
    context: CaptureContext,
}

impl ScreenshotSource {
    pub fn new(frames: Arc<dyn FrameSource>, capture_dir: PathBuf, context: CaptureContext) -> Self {
        Self {
            frames,
            capture_dir,
            context,
        }
    }
}

#[async_trait]
impl CaptureSource for ScreenshotSource {
    fn name(&self) -> &'static str {
        "screenshot"
    }

    async fn capture(&mut self) -> Result<Vec<CaptureArtifact>, CaptureError> {
        let frame = self.frames.capture_frame().await?;
        if frame.is_empty() {
            return Err(CaptureError::NoData("frame source".to_string()));
        }

        let captured_at = Utc::now();
        tokio::fs::create_dir_all(&self.capture_dir).await?;
        let path = self
            .capture_dir
            .join(format!("screenshot_{}.png", Uuid::new_v4()));
        tokio::fs::write(&path, &frame).await?;

        debug!(path = %path.display(), size = frame.len(), "Screenshot captured");

        Ok(vec![CaptureArtifact::Screenshot(ScreenshotMeta {
            user_id: self.context.user_id.clone(),
            task_id: self.context.task_id.clone(),
            time_log_id: Some(self.context.time_log_id.clone()),
            captured_at,
            local_path: Some(path),
            image_url: None,
        })])
    }
}
