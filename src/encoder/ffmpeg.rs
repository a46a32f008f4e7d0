//! ffmpeg-backed encoder
//!
//! Frames are spooled to `<output>/<session_id>/frame_NNNNNN.jpg` as they
//! arrive, then stitched into `<output>/<session_id>.mp4` on finish.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Artifact, EncoderError, EncoderFactory, EncoderPipeline};
use crate::capture::Frame;
use crate::config::EncoderConfig;
use crate::process::run_with_timeout;

const FRAME_PATTERN: &str = "frame_%06d.jpg";

fn frame_file_name(index: u64) -> String {
    format!("frame_{:06}.jpg", index)
}

/// Creates one [`FfmpegEncoder`] per session under the output directory
pub struct FfmpegEncoderFactory {
    output_dir: PathBuf,
    program: String,
    fps: u32,
    timeout: Duration,
    delete_frames: bool,
}

impl FfmpegEncoderFactory {
    pub fn new(config: &EncoderConfig, output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            program: config.program.clone(),
            fps: config.fps,
            timeout: Duration::from_millis(config.encode_timeout_ms),
            delete_frames: config.delete_frames,
        }
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn create(&mut self, session_id: Uuid) -> Result<Box<dyn EncoderPipeline>, EncoderError> {
        let spool_dir = self.output_dir.join(session_id.to_string());
        std::fs::create_dir_all(&spool_dir).map_err(|e| {
            EncoderError::EncodeFault(format!("failed to create {:?}: {}", spool_dir, e))
        })?;

        debug!("Encoder spooling frames to {:?}", spool_dir);

        Ok(Box::new(FfmpegEncoder {
            spool_dir,
            video_path: self.output_dir.join(format!("{}.mp4", session_id)),
            program: self.program.clone(),
            fps: self.fps,
            timeout: self.timeout,
            delete_frames: self.delete_frames,
            frames: 0,
        }))
    }
}

pub struct FfmpegEncoder {
    spool_dir: PathBuf,
    video_path: PathBuf,
    program: String,
    fps: u32,
    timeout: Duration,
    delete_frames: bool,
    frames: u64,
}

impl FfmpegEncoder {
    fn stitch(&self) -> Result<(), EncoderError> {
        let mut command = Command::new(&self.program);
        command
            .args(["-y", "-loglevel", "error", "-framerate"])
            .arg(self.fps.to_string())
            .args(["-start_number", "0", "-i"])
            .arg(self.spool_dir.join(FRAME_PATTERN))
            .args([
                "-c:v",
                "libx264",
                "-pix_fmt",
                "yuv420p",
                "-vf",
                "scale=trunc(iw/2)*2:trunc(ih/2)*2",
            ])
            .arg(&self.video_path);

        let output = run_with_timeout(command, self.timeout)
            .map_err(|e| EncoderError::EncodeFault(e.to_string()))?;

        if !output.status.success() {
            return Err(EncoderError::EncodeFault(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    fn remove_spool(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.spool_dir) {
            warn!("Failed to remove frame spool {:?}: {}", self.spool_dir, e);
        }
    }
}

impl EncoderPipeline for FfmpegEncoder {
    fn submit(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        let path = self.spool_dir.join(frame_file_name(self.frames));
        std::fs::write(&path, frame.data.as_slice()).map_err(|e| {
            EncoderError::EncodeFault(format!("failed to write {:?}: {}", path, e))
        })?;
        self.frames += 1;
        Ok(())
    }

    fn frame_count(&self) -> u64 {
        self.frames
    }

    fn finish(self: Box<Self>) -> Result<Artifact, EncoderError> {
        if self.frames == 0 {
            self.remove_spool();
            return Err(EncoderError::NoFrames);
        }

        info!(
            "Encoding {} frames at {} fps into {:?}",
            self.frames, self.fps, self.video_path
        );
        self.stitch()?;

        let (size_bytes, sha256) = digest_file(&self.video_path).map_err(|e| {
            EncoderError::EncodeFault(format!("failed to read {:?}: {}", self.video_path, e))
        })?;

        if self.delete_frames {
            self.remove_spool();
        }

        Ok(Artifact {
            path: self.video_path.clone(),
            frame_count: self.frames,
            size_bytes,
            sha256,
        })
    }

    fn abort(self: Box<Self>) {
        warn!(
            "Encoder aborted with {} frames left in {:?}",
            self.frames, self.spool_dir
        );
    }
}

/// Size and hex SHA-256 of a file, streamed
fn digest_file(path: &Path) -> std::io::Result<(u64, String)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}
