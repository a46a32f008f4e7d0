//! Still capture
//!
//! The orchestrator drives a [`CaptureSource`] one still at a time. The
//! camera is opened when a session starts and released when it ends, on
//! both the clean and the fault path.

mod camera;

pub use camera::StillCommandCamera;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// One captured still image (JPEG bytes)
///
/// The payload is shared so the preview publisher and the encoder can hold
/// the same frame without copying it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Arc<Vec<u8>>,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data: Arc::new(data),
            captured_at: Utc::now(),
            width,
            height,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// Capture failure taxonomy
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("camera busy")]
    DeviceBusy,

    #[error("camera fault: {0}")]
    DeviceFault(String),

    #[error("capture timed out")]
    Timeout,
}

/// Camera driver contract.
///
/// Calls are never overlapped: the orchestrator waits for each capture to
/// return before issuing the next one. Implementations must bound every
/// call and report an overrun as [`CaptureError::Timeout`].
pub trait CaptureSource: Send {
    /// Acquire the camera for a session
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Produce one still frame
    fn capture_still(&mut self) -> Result<Frame, CaptureError>;

    /// Release the camera. Must be safe to call when not open.
    fn release(&mut self);

    fn is_open(&self) -> bool;
}
