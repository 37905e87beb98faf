//! TimeFlow Agent - desktop activity capture with durable offline sync.
//!
//! This crate provides the capture-and-sync core of the TimeFlow desktop
//! agent. While a user tracks time against a task, the agent takes
//! screenshots, records foreground application spans, and follows idle/active
//! state, then writes everything to the remote store.
//!
//! # Delivery
//!
//! Every record is either confirmed by the remote store or kept in the
//! [`queue::DurableQueue`] on disk until a later flush confirms it. Records are
//! never dropped; at worst they are delivered twice.
//!
//! # Modules
//!
//! - [`types`]: Records produced while tracking
//! - [`remote`]: Remote store client (Supabase) and an in-memory store
//! - [`queue`]: Durable queue of unconfirmed records
//! - [`sync`]: Delivery of records with queue fallback
//! - [`session`]: Persistence of the current tracking session
//! - [`idle`]: Idle detection from cursor samples
//! - [`capture`]: Screenshot and foreground-app capture loops
//! - [`platform`]: Command-backed platform capabilities
//! - [`coordinator`]: Tracking lifecycle and power events
//! - [`control`]: JSON-lines command surface for the host UI
//! - [`config`]: Configuration from environment variables
//! - [`utils`]: Shared utilities (atomic JSON files)

pub mod capture;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod idle;
pub mod platform;
pub mod queue;
pub mod remote;
pub mod session;
pub mod sync;
pub mod types;
pub mod utils;

pub use capture::{CaptureError, CaptureLoop, CaptureSource};
pub use config::Config;
pub use control::{ControlCommand, ControlResponse};
pub use coordinator::{
    Activity, Capabilities, Coordinator, PowerEvent, ResumeDecision, TrackingSettings,
    TrackingState,
};
pub use idle::{IdleDetector, IdleMonitor};
pub use queue::{DurableQueue, FlushReport, QueueCounts};
pub use remote::{MemoryStore, RemoteError, RemoteStore, SupabaseStore};
pub use session::SessionStore;
pub use sync::{Delivery, SyncSink};
pub use types::{
    AppLogEntry, CaptureArtifact, IdleState, QueueItem, QueueKind, QueuedRecord, ScreenshotMeta,
    TimeLogEntry, TimeLogMutation, TimeLogPatch, TimeLogStatus, TrackingSession,
};
