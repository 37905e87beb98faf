//! Command-backed platform capabilities.
//!
//! Screen grabs, foreground-window queries, and cursor sampling are delegated
//! to external commands configured through the environment, e.g.:
//!
//! - `TIMEFLOW_SCREENSHOT_CMD="grim -"` (PNG on stdout)
//! - `TIMEFLOW_WINDOW_CMD="/usr/local/bin/active-window"` (app name on the
//!   first line, window title on the second)
//! - `TIMEFLOW_CURSOR_CMD="xdotool getmouselocation"` (`x:512 y:384 ...`)
//!
//! A capability without a command reports [`CaptureError::Unsupported`] on
//! every call, which the capture loops log and skip.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::capture::{ActiveWindow, CaptureError, FrameSource, WindowSource};
use crate::config::Config;
use crate::coordinator::Capabilities;
use crate::idle::{CursorPosition, CursorSource};

/// An external program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
}

impl ShellCommand {
    /// Splits a command line on whitespace. Returns `None` for a blank line.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Runs the command and returns its stdout.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::Failed`] if the program cannot be spawned or
    /// exits unsuccessfully.
    pub async fn run(&self) -> Result<Vec<u8>, CaptureError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CaptureError::Failed(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        debug!(program = %self.program, bytes = output.stdout.len(), "Command finished");
        Ok(output.stdout)
    }
}

/// A capability backed by an optional command.
#[derive(Debug, Clone)]
pub struct CommandCapability {
    name: &'static str,
    command: Option<ShellCommand>,
}

impl CommandCapability {
    #[must_use]
    pub fn new(name: &'static str, command_line: Option<&str>) -> Self {
        let command = command_line.and_then(ShellCommand::parse);
        match &command {
            Some(cmd) => info!(capability = name, program = %cmd.program, "Capability enabled"),
            None => info!(capability = name, "Capability not configured"),
        }
        Self { name, command }
    }

    async fn output(&self) -> Result<Vec<u8>, CaptureError> {
        match &self.command {
            Some(command) => command.run().await,
            None => Err(CaptureError::Unsupported(format!(
                "no command configured for {}",
                self.name
            ))),
        }
    }
}

#[async_trait]
impl FrameSource for CommandCapability {
    async fn capture_frame(&self) -> Result<Vec<u8>, CaptureError> {
        self.output().await
    }
}

#[async_trait]
impl WindowSource for CommandCapability {
    async fn active_window(&self) -> Result<Option<ActiveWindow>, CaptureError> {
        let stdout = self.output().await?;
        Ok(parse_window(&String::from_utf8_lossy(&stdout)))
    }
}

#[async_trait]
impl CursorSource for CommandCapability {
    async fn position(&self) -> Result<CursorPosition, CaptureError> {
        let stdout = self.output().await?;
        let text = String::from_utf8_lossy(&stdout);
        parse_cursor(&text)
            .ok_or_else(|| CaptureError::Failed(format!("unrecognised cursor output: {}", text.trim())))
    }
}

/// Builds the capabilities described by `config`.
#[must_use]
pub fn capabilities_from_config(config: &Config) -> Capabilities {
    Capabilities {
        frames: Arc::new(CommandCapability::new(
            "screenshot",
            config.screenshot_command.as_deref(),
        )),
        windows: Arc::new(CommandCapability::new(
            "window",
            config.window_command.as_deref(),
        )),
        cursor: Arc::new(CommandCapability::new(
            "cursor",
            config.cursor_command.as_deref(),
        )),
    }
}

/// Parses `app name` on the first line and the window title on the second.
fn parse_window(output: &str) -> Option<ActiveWindow> {
    let mut lines = output.lines();
    let app_name = lines.next()?.trim().to_string();
    if app_name.is_empty() {
        return None;
    }
    let window_title = lines.next().unwrap_or_default().trim().to_string();
    Some(ActiveWindow {
        app_name,
        window_title,
    })
}

/// Accepts `x:12 y:34 ...`, `12 34`, or `12,34`.
fn parse_cursor(output: &str) -> Option<CursorPosition> {
    let mut numbers = output
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(|token| token.rsplit(':').next().unwrap_or(token));

    let x = numbers.next()?.parse().ok()?;
    let y = numbers.next()?.parse().ok()?;
    Some(CursorPosition { x, y })
}
