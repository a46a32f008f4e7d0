//! Printer status source
//!
//! Tracks the remote printer's job phase and pushes a notification on every
//! phase change. Each notification carries a strictly increasing sequence
//! number so the orchestrator can discard stale or duplicated deliveries.

mod poller;

pub use poller::spawn_printer_poller;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterPhase {
    Printing,
    Paused,
    Idle,
    Offline,
    Error,
}

impl PrinterPhase {
    /// Map a printer firmware/host state string to a phase.
    ///
    /// Covers Moonraker/Klipper (`printing`, `paused`, `standby`,
    /// `complete`, `cancelled`, `error`), OctoPrint (`Printing`, `Paused`,
    /// `Operational`, `Offline`) and Bambu (`RUNNING`, `PAUSE`, `FINISH`,
    /// `FAILED`, `IDLE`).
    pub fn from_state_str(state: &str) -> Option<Self> {
        let normalized = state.trim().to_ascii_lowercase();
        let phase = match normalized.as_str() {
            "printing" | "running" | "prepare" | "slicing" => PrinterPhase::Printing,
            "paused" | "pause" | "pausing" => PrinterPhase::Paused,
            "standby" | "idle" | "ready" | "operational" | "complete" | "completed"
            | "finish" | "finished" | "cancelled" | "canceled" | "cancelling" => PrinterPhase::Idle,
            "offline" | "disconnected" | "closed" => PrinterPhase::Offline,
            "error" | "failed" | "shutdown" => PrinterPhase::Error,
            _ => return None,
        };
        Some(phase)
    }
}

/// Last known printer phase plus its sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrinterState {
    pub phase: PrinterPhase,
    pub sequence: u64,
}

impl PrinterState {
    pub fn new(phase: PrinterPhase, sequence: u64) -> Self {
        Self { phase, sequence }
    }
}

/// Turns a stream of raw readings into change notifications
#[derive(Debug, Default)]
pub struct PhaseTracker {
    last: Option<PrinterPhase>,
    sequence: u64,
}

impl PhaseTracker {
    /// Record a reading; returns a notification when the phase changed
    pub fn observe(&mut self, phase: PrinterPhase) -> Option<PrinterState> {
        if self.last == Some(phase) {
            return None;
        }
        self.last = Some(phase);
        self.sequence += 1;
        Some(PrinterState::new(phase, self.sequence))
    }

    pub fn current(&self) -> Option<PrinterState> {
        self.last.map(|phase| PrinterState::new(phase, self.sequence))
    }
}
