//! Command surface for the host UI.
//!
//! The host drives the agent with one JSON object per line, for example:
//!
//! ```json
//! {"command":"set_user_id","id":"user-1"}
//! {"command":"set_task_id","id":"task-9"}
//! {"command":"start_tracking"}
//! {"command":"power","event":"suspend"}
//! {"command":"resolve_resume","decision":"resume"}
//! ```
//!
//! Every line gets exactly one [`ControlResponse`]. Malformed input produces
//! an `error` response; tracking failures never do, since they are absorbed
//! by the coordinator.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::coordinator::{Coordinator, PowerEvent, ResumeDecision, TrackingState};
use crate::types::TrackingSession;

/// A command sent by the host UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    SetUserId { id: String },
    SetTaskId { id: String },
    StartTracking,
    StopTracking,
    SyncOfflineData,
    LoadSession,
    ClearSession,
    State,
    Power { event: PowerEvent },
    ResolveResume { decision: ResumeDecision },
}

/// The agent's answer to a [`ControlCommand`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Ok,
    State {
        state: TrackingState,
    },
    Sync {
        delivered: usize,
        remaining: usize,
    },
    Session {
        session: Option<TrackingSession>,
    },
    /// A saved session exists and the host should ask whether to resume it.
    ResumePrompt {
        session: TrackingSession,
    },
    Error {
        message: String,
    },
}

/// Runs `command` against `coordinator`.
pub async fn dispatch(coordinator: &Coordinator, command: ControlCommand) -> ControlResponse {
    debug!(command = ?command, "Control command received");

    match command {
        ControlCommand::SetUserId { id } => {
            coordinator.set_user_id(id);
            ControlResponse::Ok
        }
        ControlCommand::SetTaskId { id } => {
            coordinator.set_task_id(id);
            ControlResponse::Ok
        }
        ControlCommand::StartTracking => ControlResponse::State {
            state: coordinator.start_tracking().await,
        },
        ControlCommand::StopTracking => ControlResponse::State {
            state: coordinator.stop_tracking().await,
        },
        ControlCommand::SyncOfflineData => {
            let report = coordinator.sync_offline_data().await;
            ControlResponse::Sync {
                delivered: report.delivered,
                remaining: report.remaining,
            }
        }
        ControlCommand::LoadSession => ControlResponse::Session {
            session: coordinator.load_session(),
        },
        ControlCommand::ClearSession => {
            coordinator.clear_session();
            ControlResponse::Ok
        }
        ControlCommand::State => ControlResponse::State {
            state: coordinator.state(),
        },
        ControlCommand::Power { event } => match coordinator.handle_power_event(event).await {
            Some(session) => ControlResponse::ResumePrompt { session },
            None => ControlResponse::State {
                state: coordinator.state(),
            },
        },
        ControlCommand::ResolveResume { decision } => ControlResponse::State {
            state: coordinator.resolve_resume(decision).await,
        },
    }
}

/// Parses one input line and dispatches it.
///
/// Returns `None` for blank lines.
pub async fn handle_line(coordinator: &Coordinator, line: &str) -> Option<ControlResponse> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let response = match serde_json::from_str::<ControlCommand>(line) {
        Ok(command) => dispatch(coordinator, command).await,
        Err(e) => {
            warn!(error = %e, "Invalid control command");
            ControlResponse::Error {
                message: format!("invalid command: {e}"),
            }
        }
    };
    Some(response)
}
