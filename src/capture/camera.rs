//! Camera driver backed by a still-capture program (`rpicam-still`)

use std::io::Cursor;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CaptureError, CaptureSource, Frame};
use crate::config::CameraConfig;
use crate::process::{find_program, run_with_timeout, RunError};

/// Runs the configured program once per still and reads a JPEG from stdout
pub struct StillCommandCamera {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    open: bool,
}

impl StillCommandCamera {
    pub fn new(config: &CameraConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_millis(config.capture_timeout_ms),
            open: false,
        }
    }
}

impl CaptureSource for StillCommandCamera {
    fn open(&mut self) -> Result<(), CaptureError> {
        if self.open {
            return Ok(());
        }

        let Some(path) = find_program(&self.program) else {
            return Err(CaptureError::DeviceFault(format!(
                "capture program '{}' not found",
                self.program
            )));
        };

        info!("Camera opened via {:?}", path);
        self.open = true;
        Ok(())
    }

    fn capture_still(&mut self) -> Result<Frame, CaptureError> {
        if !self.open {
            return Err(CaptureError::DeviceFault("camera not open".to_string()));
        }

        let mut command = Command::new(&self.program);
        command.args(&self.args);

        let output = run_with_timeout(command, self.timeout).map_err(|e| match e {
            RunError::TimedOut { .. } => CaptureError::Timeout,
            other => CaptureError::DeviceFault(other.to_string()),
        })?;

        if !output.status.success() {
            return Err(classify_failure(&output.stderr));
        }

        if output.stdout.is_empty() {
            return Err(CaptureError::DeviceFault(
                "capture program produced no image data".to_string(),
            ));
        }

        let (width, height) = probe_dimensions(&output.stdout)?;
        debug!("Captured {}x{} still ({} bytes)", width, height, output.stdout.len());

        Ok(Frame::new(output.stdout, width, height))
    }

    fn release(&mut self) {
        if self.open {
            info!("Camera released");
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Map a failed run to a capture error from what the program printed
fn classify_failure(stderr: &str) -> CaptureError {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("busy") || lowered.contains("in use") {
        return CaptureError::DeviceBusy;
    }

    let detail = stderr.lines().last().unwrap_or("").trim();
    warn!("Capture program failed: {}", detail);
    CaptureError::DeviceFault(if detail.is_empty() {
        "capture program failed".to_string()
    } else {
        detail.to_string()
    })
}

/// Read image dimensions from the header without decoding pixel data
pub(crate) fn probe_dimensions(data: &[u8]) -> Result<(u32, u32), CaptureError> {
    image::ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| CaptureError::DeviceFault(format!("unreadable image: {}", e)))?
        .into_dimensions()
        .map_err(|e| CaptureError::DeviceFault(format!("unreadable image: {}", e)))
}
