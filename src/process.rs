//! Bounded execution of external driver programs
//!
//! Camera and encoder drivers shell out to `rpicam-still` and `ffmpeg`.
//! Every call carries a deadline so a wedged device can never block the
//! orchestrator indefinitely.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Output of a program that ran to completion
#[derive(Debug)]
pub struct ProgramOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("failed waiting on {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run `command` to completion, killing it once `timeout` elapses.
///
/// stdout and stderr are drained on helper threads so a chatty child
/// cannot stall on a full pipe.
pub fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<ProgramOutput, RunError> {
    let program = command.get_program().to_string_lossy().into_owned();

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout_reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = err.read_to_string(&mut buf);
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                warn!("{} exceeded {:?}, killing it", program, timeout);
                let _ = child.kill();
                let _ = child.wait();
                return Err(RunError::TimedOut { program, timeout });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                let _ = child.kill();
                return Err(RunError::Wait { program, source });
            }
        }
    };

    let stdout = stdout_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    debug!(
        "{} exited with {} ({} bytes stdout)",
        program,
        status,
        stdout.len()
    );

    Ok(ProgramOutput {
        status,
        stdout,
        stderr,
    })
}

/// Resolve a program name the way a shell would, via `PATH`
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}
