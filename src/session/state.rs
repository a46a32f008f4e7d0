//! Session state and the snapshot shape published to observers

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::command::CommandAction;
use crate::indicator::Indicator;
use crate::printer::PrinterState;

/// Session state machine.
///
/// ```text
/// idle → capturing ↔ paused
///           ↓          ↓
///        finalizing ←──┘ → idle
/// any fault → error → (acknowledge) → idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Capturing,
    Paused,
    Finalizing,
    Error,
}

impl SessionState {
    pub fn indicator(self) -> Indicator {
        match self {
            SessionState::Idle => Indicator::Idle,
            SessionState::Capturing | SessionState::Finalizing => Indicator::Recording,
            SessionState::Paused => Indicator::Paused,
            SessionState::Error => Indicator::Error,
        }
    }

    /// Operator actions accepted in this state
    pub fn legal_actions(self) -> &'static [CommandAction] {
        match self {
            SessionState::Idle => &[CommandAction::Start],
            SessionState::Capturing => &[CommandAction::Stop, CommandAction::Pause],
            SessionState::Paused => &[CommandAction::Resume, CommandAction::Stop],
            SessionState::Finalizing => &[],
            SessionState::Error => &[CommandAction::Acknowledge],
        }
    }

    pub fn accepts(self, action: CommandAction) -> bool {
        self.legal_actions().contains(&action)
    }

    /// A session (camera + encoder) is held in these states
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Capturing | SessionState::Paused)
    }
}

/// What started a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Button,
    Command,
    Printer,
}

/// Bookkeeping for the recording in progress
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub frame_count: u64,
    pub last_capture_at: Option<Instant>,
    pub capture_interval: Duration,
}

impl Session {
    pub fn new(trigger: Trigger, capture_interval: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            started_at: Utc::now(),
            frame_count: 0,
            last_capture_at: None,
            capture_interval,
        }
    }

    /// Whether a capture is due at `now`
    pub fn capture_due(&self, now: Instant) -> bool {
        match self.last_capture_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.capture_interval,
        }
    }
}

/// Point-in-time view of the orchestrator for reporters and operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub session_id: Option<Uuid>,
    pub trigger: Option<Trigger>,
    pub frame_count: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub capture_interval_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub stale_notifications: u64,
    pub printer: Option<PrinterState>,
    pub camera_open: bool,
    pub last_artifact: Option<PathBuf>,
}

#[cfg(test)]
impl SessionSnapshot {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            trigger: None,
            frame_count: 0,
            started_at: None,
            capture_interval_ms: None,
            consecutive_failures: 0,
            total_failures: 0,
            stale_notifications: 0,
            printer: None,
            camera_open: false,
            last_artifact: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_due() {
        let mut session = Session::new(Trigger::Button, Duration::from_millis(1000));
        let t0 = Instant::now();
        assert!(session.capture_due(t0));

        session.last_capture_at = Some(t0);
        assert!(!session.capture_due(t0 + Duration::from_millis(999)));
        assert!(session.capture_due(t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn test_finalizing_and_idle_accept_nothing_but_start() {
        assert!(SessionState::Finalizing.legal_actions().is_empty());
        assert_eq!(SessionState::Idle.legal_actions(), &[CommandAction::Start]);
        assert!(SessionState::Error.accepts(CommandAction::Acknowledge));
        assert!(!SessionState::Capturing.accepts(CommandAction::Resume));
    }
}
