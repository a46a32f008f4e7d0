//! Encoder pipeline
//!
//! One pipeline is created per session. Frames are appended in capture
//! order and [`EncoderPipeline::finish`] turns them into a single video.

mod ffmpeg;

pub use ffmpeg::FfmpegEncoderFactory;

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::capture::Frame;

/// A finished timelapse video
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub frame_count: u64,
    pub size_bytes: u64,
    /// Hex SHA-256 of the video file
    pub sha256: String,
}

/// Encoder failure taxonomy
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncoderError {
    #[error("encode fault: {0}")]
    EncodeFault(String),

    #[error("no frames were submitted")]
    NoFrames,
}

/// Per-session encoder.
///
/// Ordering is significant: the video presents frames in submission order.
pub trait EncoderPipeline: Send {
    fn submit(&mut self, frame: &Frame) -> Result<(), EncoderError>;

    fn frame_count(&self) -> u64;

    /// Produce the video and release encoder resources.
    /// With zero submitted frames this returns [`EncoderError::NoFrames`].
    fn finish(self: Box<Self>) -> Result<Artifact, EncoderError>;

    /// Release encoder resources without producing a video
    fn abort(self: Box<Self>);
}

/// Builds a fresh pipeline for each session
pub trait EncoderFactory: Send {
    fn create(&mut self, session_id: Uuid) -> Result<Box<dyn EncoderPipeline>, EncoderError>;
}
