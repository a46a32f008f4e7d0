//! Timelapse session orchestration
//!
//! Button edges, printer notifications and operator commands are all pushed
//! onto one ordered channel. A single engine loop consumes that channel and
//! drives the [`Orchestrator`], so no two transitions ever run concurrently.

mod command;
mod engine;
mod orchestrator;
mod state;

pub use command::{Command, CommandAction, CommandReply};
pub use engine::{create_session_engine, SessionHandle};
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use state::{SessionSnapshot, SessionState};

#[cfg(test)]
pub(crate) use orchestrator::tests as orchestrator_tests;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::button::ButtonEdge;
use crate::encoder::Artifact;
use crate::printer::PrinterState;

/// Non-fatal session errors, reported to the originator only
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("{action} is not allowed while {state:?}")]
    IllegalTransition {
        action: CommandAction,
        state: SessionState,
    },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("stale printer notification (seq {sequence}, last seen {last_seen})")]
    StaleNotification { sequence: u64, last_seen: u64 },

    #[error("could not start session: {0}")]
    StartFailed(String),
}

impl SessionError {
    /// Stable machine-readable name
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::IllegalTransition { .. } => "illegal_transition",
            SessionError::InvalidCommand(_) => "invalid_command",
            SessionError::StaleNotification { .. } => "stale_notification",
            SessionError::StartFailed(_) => "start_failed",
        }
    }
}

/// Events delivered to the engine loop
#[derive(Debug)]
pub enum SessionEvent {
    Button(ButtonEdge),
    Printer(PrinterState),
    Command {
        command: Command,
        reply: Option<oneshot::Sender<CommandReply>>,
    },
    /// Finalize, then stop the engine loop
    Shutdown { done: oneshot::Sender<SessionSnapshot> },
}

/// Status updates broadcast by the engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionStatus {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    FrameCaptured {
        session_id: Uuid,
        frame_count: u64,
        captured_at: DateTime<Utc>,
        width: u32,
        height: u32,
    },
    CaptureFailed {
        reason: String,
        consecutive: u32,
    },
    /// A session finished; `artifact` is None when no frames were captured
    Completed {
        session_id: Uuid,
        frame_count: u64,
        artifact: Option<Artifact>,
    },
    Fault {
        reason: String,
    },
    CommandRejected {
        action: String,
        reason: String,
    },
}
