//! Idle detection from cursor movement.
//!
//! [`IdleDetector`] is the pure state machine: it is fed cursor samples and
//! reports a transition only when the idle flag flips. [`IdleMonitor`] runs it
//! on a fixed poll period, publishes the current [`IdleState`] on a watch
//! channel for the capture loops, and sends each transition to a single
//! listener.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tokio::time::Instant;
//! use timeflow_agent::idle::{CursorPosition, IdleDetector};
//!
//! let start = Instant::now();
//! let mut detector = IdleDetector::new(Duration::from_secs(60), start);
//! let still = CursorPosition { x: 10, y: 20 };
//!
//! assert_eq!(detector.observe(still, start), None);
//! assert_eq!(detector.observe(still, start + Duration::from_secs(61)), Some(true));
//! assert_eq!(detector.observe(still, start + Duration::from_secs(90)), None);
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CaptureError;
use crate::types::IdleState;

/// A cursor location in screen coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorPosition {
    pub x: i32,
    pub y: i32,
}

/// Platform capability reporting the cursor position.
#[async_trait]
pub trait CursorSource: Send + Sync {
    async fn position(&self) -> Result<CursorPosition, CaptureError>;
}

/// Edge-triggered idle state machine.
#[derive(Debug, Clone)]
pub struct IdleDetector {
    idle_timeout: Duration,
    last_position: Option<CursorPosition>,
    last_activity_at: Instant,
    state: IdleState,
}

impl IdleDetector {
    /// Creates a detector that considers the user active as of `now`.
    #[must_use]
    pub fn new(idle_timeout: Duration, now: Instant) -> Self {
        Self {
            idle_timeout,
            last_position: None,
            last_activity_at: now,
            state: IdleState::active(Utc::now()),
        }
    }

    /// Feeds one cursor sample taken at `now`.
    ///
    /// The first sample only sets the baseline position. Returns the new idle
    /// flag when it differs from the previous one, `None` otherwise.
    pub fn observe(&mut self, position: CursorPosition, now: Instant) -> Option<bool> {
        if self.last_position != Some(position) {
            if self.last_position.is_some() {
                self.last_activity_at = now;
                self.state.last_input_at = Utc::now();
            }
            self.last_position = Some(position);
        }

        let idle = now.saturating_duration_since(self.last_activity_at) > self.idle_timeout;
        if idle == self.state.is_idle {
            return None;
        }

        self.state.is_idle = idle;
        Some(idle)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.is_idle
    }

    #[must_use]
    pub fn state(&self) -> IdleState {
        self.state
    }
}

/// Poll settings for an [`IdleMonitor`].
#[derive(Debug, Clone, Copy)]
pub struct IdleSettings {
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
}

/// Background task polling a [`CursorSource`] through an [`IdleDetector`].
///
/// Each transition is sent on the channel given to [`start`](Self::start).
/// The poll loop never waits on the listener, so a slow or failing transition
/// handler cannot delay idle detection.
#[derive(Debug)]
pub struct IdleMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    state: watch::Receiver<IdleState>,
}

impl IdleMonitor {
    /// Spawns the poll loop. It runs until [`stop`](Self::stop) is called or
    /// `cancel` fires.
    pub fn start(
        cursor: Arc<dyn CursorSource>,
        settings: IdleSettings,
        transitions: mpsc::UnboundedSender<bool>,
        cancel: CancellationToken,
    ) -> Self {
        let detector = IdleDetector::new(settings.idle_timeout, Instant::now());
        let (state_tx, state) = watch::channel(detector.state());

        let handle = tokio::spawn(poll_loop(
            cursor,
            detector,
            settings.poll_interval,
            state_tx,
            transitions,
            cancel.clone(),
        ));

        Self {
            cancel,
            handle,
            state,
        }
    }

    /// A receiver that always holds the latest [`IdleState`].
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<IdleState> {
        self.state.clone()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.borrow().is_idle
    }

    /// Stops polling and waits for the loop to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Idle monitor task ended abnormally");
        }
    }
}

async fn poll_loop(
    cursor: Arc<dyn CursorSource>,
    mut detector: IdleDetector,
    poll_interval: Duration,
    state_tx: watch::Sender<IdleState>,
    transitions: mpsc::UnboundedSender<bool>,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // A hung capability must not stall detection past the next poll.
        let sample = tokio::select! {
            () = cancel.cancelled() => break,
            sample = time::timeout(poll_interval, cursor.position()) => sample,
        };

        let position = match sample {
            Ok(Ok(position)) => position,
            Ok(Err(e)) => {
                warn!(error = %e, "Cursor sample failed, skipping poll");
                continue;
            }
            Err(_) => {
                warn!("Cursor sample timed out, skipping poll");
                continue;
            }
        };

        let transition = detector.observe(position, Instant::now());
        state_tx.send_replace(detector.state());

        if let Some(idle) = transition {
            info!(is_idle = idle, "Idle state changed");
            if transitions.send(idle).is_err() {
                debug!("Idle transition listener is gone");
            }
        }
    }

    debug!("Idle monitor stopped");
}
