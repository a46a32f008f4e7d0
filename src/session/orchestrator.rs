//! Session orchestrator
//!
//! Owns the session state machine and the drivers it acquires for a
//! session. Every method runs to completion before the next one starts
//! (the engine loop serializes calls), which is what makes captures and
//! encoder calls single-flight.
//!
//! | From | Event | To |
//! |---|---|---|
//! | Idle | press, `start`, printer enters Printing (auto-start) | Capturing |
//! | Capturing | tick | Capturing |
//! | Capturing | press, `stop`, printer leaves Printing | Finalizing |
//! | Capturing | `pause`, printer enters Paused | Paused |
//! | Paused | `resume`, printer enters Printing | Capturing |
//! | Paused | press, `stop` | Finalizing |
//! | Finalizing | encoder done | Idle |
//! | any | failure threshold, encode fault | Error |
//! | Error | `acknowledge` | Idle |

use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::command::{Command, CommandAction, CommandReply};
use super::state::{Session, SessionSnapshot, SessionState, Trigger};
use super::{SessionError, SessionStatus};
use crate::button::{ButtonEdge, EdgeKind};
use crate::capture::{CaptureError, CaptureSource, Frame};
use crate::config::TimelapseConfig;
use crate::encoder::{Artifact, EncoderError, EncoderFactory, EncoderPipeline};
use crate::indicator::IndicatorOutput;
use crate::printer::{PrinterPhase, PrinterState};

/// Session policy, read from configuration at startup
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub capture_interval: Duration,
    pub failure_threshold: u32,
    pub auto_start_on_print: bool,
    pub pause_with_printer: bool,
    pub stop_with_printer: bool,
}

impl From<&TimelapseConfig> for OrchestratorSettings {
    fn from(config: &TimelapseConfig) -> Self {
        Self {
            capture_interval: Duration::from_millis(config.capture_interval_ms),
            failure_threshold: config.failure_threshold.max(1),
            auto_start_on_print: config.auto_start_on_print,
            pause_with_printer: config.pause_with_printer,
            stop_with_printer: config.stop_with_printer,
        }
    }
}

/// Fatal conditions that drive the session into Error
#[derive(Debug, Error)]
enum Fault {
    #[error("{failures} consecutive capture failures, last: {last}")]
    CaptureFailures { failures: u32, last: CaptureError },

    #[error("camera unavailable: {0}")]
    CameraOpen(CaptureError),

    #[error(transparent)]
    Encoder(EncoderError),
}

/// Receives pending statuses and a fresh snapshot before the orchestrator
/// blocks on a long encoder call
pub type ProgressHook = Box<dyn FnMut(Vec<SessionStatus>, SessionSnapshot) + Send>;

pub struct Orchestrator {
    settings: OrchestratorSettings,
    camera: Box<dyn CaptureSource>,
    encoders: Box<dyn EncoderFactory>,
    indicator: Box<dyn IndicatorOutput>,

    state: SessionState,
    session: Option<Session>,
    pipeline: Option<Box<dyn EncoderPipeline>>,
    /// Cached copy of the printer source's latest state
    printer: Option<PrinterState>,
    last_press_at: Option<Instant>,

    consecutive_failures: u32,
    total_failures: u64,
    stale_notifications: u64,
    last_artifact: Option<Artifact>,

    /// Status updates not yet published by the engine
    outbox: Vec<SessionStatus>,
    /// Latest captured frame not yet published by the engine
    preview: Option<Frame>,
    progress: Option<ProgressHook>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        camera: Box<dyn CaptureSource>,
        encoders: Box<dyn EncoderFactory>,
        mut indicator: Box<dyn IndicatorOutput>,
    ) -> Self {
        indicator.set_indicator(SessionState::Idle.indicator());

        Self {
            settings,
            camera,
            encoders,
            indicator,
            state: SessionState::Idle,
            session: None,
            pipeline: None,
            printer: None,
            last_press_at: None,
            consecutive_failures: 0,
            total_failures: 0,
            stale_notifications: 0,
            last_artifact: None,
            outbox: Vec::new(),
            preview: None,
            progress: None,
        }
    }

    pub fn set_progress_hook(&mut self, hook: ProgressHook) {
        self.progress = Some(hook);
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.as_ref();
        SessionSnapshot {
            state: self.state,
            session_id: session.map(|s| s.id),
            trigger: session.map(|s| s.trigger),
            frame_count: session.map(|s| s.frame_count).unwrap_or(0),
            started_at: session.map(|s| s.started_at),
            capture_interval_ms: session.map(|s| s.capture_interval.as_millis() as u64),
            consecutive_failures: self.consecutive_failures,
            total_failures: self.total_failures,
            stale_notifications: self.stale_notifications,
            printer: self.printer,
            camera_open: self.camera.is_open(),
            last_artifact: self.last_artifact.as_ref().map(|a| a.path.clone()),
        }
    }

    pub fn drain_statuses(&mut self) -> Vec<SessionStatus> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_preview(&mut self) -> Option<Frame> {
        self.preview.take()
    }

    /// Press toggles the session; release only re-asserts the indicator.
    ///
    /// A press whose timestamp does not advance past the last handled press
    /// is a redelivery and has no effect.
    pub fn handle_button_edge(&mut self, edge: ButtonEdge) -> SessionState {
        match edge.kind {
            EdgeKind::Release => {
                self.indicator.set_indicator(self.state.indicator());
            }
            EdgeKind::Press => {
                if matches!(self.last_press_at, Some(last) if edge.timestamp <= last) {
                    debug!("Ignoring redelivered button press");
                    return self.state;
                }
                self.last_press_at = Some(edge.timestamp);

                match self.state {
                    SessionState::Idle => {
                        if let Err(e) = self.start_session(Trigger::Button, None) {
                            warn!("Button start failed: {}", e);
                        }
                    }
                    SessionState::Capturing | SessionState::Paused => self.finish_session(),
                    SessionState::Finalizing => debug!("Button press ignored while finalizing"),
                    SessionState::Error => {
                        info!("Button press ignored, the error must be acknowledged first")
                    }
                }
            }
        }
        self.state
    }

    /// Validate and apply an operator command.
    ///
    /// Commands outside the current state's legal set are rejected without
    /// touching the session or the indicator.
    pub fn handle_command(&mut self, command: &Command) -> CommandReply {
        let validated = match command.validate() {
            Ok(validated) => validated,
            Err(e) => return self.reject(&command.action, e),
        };

        let action = validated.action;
        if !self.state.accepts(action) {
            let err = SessionError::IllegalTransition {
                action,
                state: self.state,
            };
            return self.reject(&command.action, err);
        }

        info!("Operator command: {}", action);
        match action {
            CommandAction::Start => {
                if let Err(e) = self.start_session(Trigger::Command, validated.interval_override) {
                    return self.reject(&command.action, e);
                }
            }
            CommandAction::Stop => self.finish_session(),
            CommandAction::Pause => self.pause(),
            CommandAction::Resume => self.resume(),
            CommandAction::Acknowledge => self.acknowledge(),
        }

        CommandReply::accepted(action, self.state)
    }

    /// Apply a printer notification. Transitions are edge-triggered against
    /// the cached previous phase.
    pub fn handle_printer_status(
        &mut self,
        update: PrinterState,
    ) -> Result<SessionState, SessionError> {
        let previous = self.printer;
        if let Some(prev) = previous {
            if update.sequence <= prev.sequence {
                self.stale_notifications += 1;
                debug!(
                    "Dropping stale printer notification {:?} (seq {} <= {})",
                    update.phase, update.sequence, prev.sequence
                );
                return Err(SessionError::StaleNotification {
                    sequence: update.sequence,
                    last_seen: prev.sequence,
                });
            }
        }
        self.printer = Some(update);

        let prev_phase = previous.map(|p| p.phase);
        let phase = update.phase;
        if prev_phase == Some(phase) {
            return Ok(self.state);
        }

        let settings = &self.settings;
        let left_printing = prev_phase == Some(PrinterPhase::Printing);
        match self.state {
            SessionState::Idle
                if phase == PrinterPhase::Printing && settings.auto_start_on_print =>
            {
                if let Err(e) = self.start_session(Trigger::Printer, None) {
                    warn!("Auto-start on print failed: {}", e);
                }
            }
            SessionState::Capturing
                if phase == PrinterPhase::Paused && settings.pause_with_printer =>
            {
                self.pause()
            }
            SessionState::Capturing
                if left_printing && phase != PrinterPhase::Paused && settings.stop_with_printer =>
            {
                self.finish_session()
            }
            SessionState::Paused
                if phase == PrinterPhase::Printing && settings.pause_with_printer =>
            {
                self.resume()
            }
            // print cancelled or finished while paused
            SessionState::Paused
                if prev_phase == Some(PrinterPhase::Paused)
                    && phase == PrinterPhase::Idle
                    && settings.stop_with_printer =>
            {
                self.finish_session()
            }
            _ => {}
        }

        Ok(self.state)
    }

    /// Capture one frame if capturing and the interval has elapsed.
    /// Returns true when a frame was captured and submitted.
    pub fn tick(&mut self, now: Instant) -> bool {
        if self.state != SessionState::Capturing {
            return false;
        }
        let due = self
            .session
            .as_ref()
            .map(|s| s.capture_due(now))
            .unwrap_or(false);
        if !due {
            return false;
        }

        let frame = match self.camera.capture_still() {
            Ok(frame) => frame,
            Err(e) => {
                self.consecutive_failures += 1;
                self.total_failures += 1;
                warn!(
                    "Capture failed ({} consecutive): {}",
                    self.consecutive_failures, e
                );
                self.outbox.push(SessionStatus::CaptureFailed {
                    reason: e.to_string(),
                    consecutive: self.consecutive_failures,
                });

                if self.consecutive_failures >= self.settings.failure_threshold {
                    self.enter_error(Fault::CaptureFailures {
                        failures: self.consecutive_failures,
                        last: e,
                    });
                }
                return false;
            }
        };
        self.consecutive_failures = 0;

        let submitted = match self.pipeline.as_mut() {
            Some(pipeline) => pipeline.submit(&frame),
            None => Err(EncoderError::EncodeFault("no encoder pipeline".to_string())),
        };
        if let Err(e) = submitted {
            self.enter_error(Fault::Encoder(e));
            return false;
        }

        if let Some(session) = self.session.as_mut() {
            session.frame_count += 1;
            session.last_capture_at = Some(now);
            debug!("Frame {} captured ({} bytes)", session.frame_count, frame.len());
            self.outbox.push(SessionStatus::FrameCaptured {
                session_id: session.id,
                frame_count: session.frame_count,
                captured_at: frame.captured_at,
                width: frame.width,
                height: frame.height,
            });
        }
        self.preview = Some(frame);
        true
    }

    /// Shutdown path: close any open session through Finalizing and leave
    /// the orchestrator Idle with the camera released. Repeat calls are
    /// no-ops.
    pub fn finalize(&mut self) -> SessionSnapshot {
        if self.state.is_active() {
            info!("Finalizing open session for shutdown");
            self.finish_session();
        }
        if self.state == SessionState::Error {
            warn!("Clearing unacknowledged error during shutdown");
            self.acknowledge();
        }
        self.camera.release();
        self.snapshot()
    }

    fn start_session(
        &mut self,
        trigger: Trigger,
        interval_override: Option<Duration>,
    ) -> Result<(), SessionError> {
        let interval = interval_override.unwrap_or(self.settings.capture_interval);
        let session = Session::new(trigger, interval);

        if let Err(e) = self.camera.open() {
            let err = SessionError::StartFailed(e.to_string());
            self.enter_error(Fault::CameraOpen(e));
            return Err(err);
        }

        let pipeline = match self.encoders.create(session.id) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                let err = SessionError::StartFailed(e.to_string());
                self.enter_error(Fault::Encoder(e));
                return Err(err);
            }
        };

        info!(
            "Session {} started by {:?}, capturing every {:?}",
            session.id, trigger, interval
        );
        self.pipeline = Some(pipeline);
        self.session = Some(session);
        self.consecutive_failures = 0;
        self.total_failures = 0;
        self.set_state(SessionState::Capturing);
        Ok(())
    }

    fn pause(&mut self) {
        self.set_state(SessionState::Paused);
    }

    fn resume(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.last_capture_at = None;
        }
        self.set_state(SessionState::Capturing);
    }

    /// Capturing/Paused → Finalizing → Idle (or Error on an encode fault)
    fn finish_session(&mut self) {
        self.set_state(SessionState::Finalizing);
        self.report_progress();

        let result = match self.pipeline.take() {
            Some(pipeline) => pipeline.finish(),
            None => Err(EncoderError::NoFrames),
        };

        let (session_id, frame_count) = self
            .session
            .as_ref()
            .map(|s| (s.id, s.frame_count))
            .unwrap_or_default();

        match result {
            Ok(artifact) => {
                info!(
                    "Session {} complete: {} frames -> {:?}",
                    session_id, artifact.frame_count, artifact.path
                );
                self.last_artifact = Some(artifact.clone());
                self.outbox.push(SessionStatus::Completed {
                    session_id,
                    frame_count,
                    artifact: Some(artifact),
                });
            }
            Err(EncoderError::NoFrames) => {
                info!("Session {} ended without frames", session_id);
                self.outbox.push(SessionStatus::Completed {
                    session_id,
                    frame_count,
                    artifact: None,
                });
            }
            Err(e) => {
                self.enter_error(Fault::Encoder(e));
                return;
            }
        }

        self.camera.release();
        self.session = None;
        self.consecutive_failures = 0;
        self.set_state(SessionState::Idle);
    }

    /// Release everything best-effort, then enter Error
    fn enter_error(&mut self, fault: Fault) {
        error!("Session fault: {}", fault);

        if let Some(pipeline) = self.pipeline.take() {
            if matches!(fault, Fault::CaptureFailures { .. }) {
                // the encoder itself is healthy, keep what was recorded
                info!("Salvaging {} recorded frames", pipeline.frame_count());
                let (session_id, frame_count) = self
                    .session
                    .as_ref()
                    .map(|s| (s.id, s.frame_count))
                    .unwrap_or_default();
                match pipeline.finish() {
                    Ok(artifact) => {
                        info!("Salvaged {} frames into {:?}", artifact.frame_count, artifact.path);
                        self.last_artifact = Some(artifact.clone());
                        self.outbox.push(SessionStatus::Completed {
                            session_id,
                            frame_count,
                            artifact: Some(artifact),
                        });
                    }
                    Err(e) => warn!("Nothing salvaged from faulted session: {}", e),
                }
            } else {
                pipeline.abort();
            }
        }
        self.camera.release();

        self.outbox.push(SessionStatus::Fault {
            reason: fault.to_string(),
        });
        self.set_state(SessionState::Error);
    }

    fn acknowledge(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.abort();
        }
        self.camera.release();
        self.session = None;
        self.consecutive_failures = 0;
        self.total_failures = 0;
        self.set_state(SessionState::Idle);
    }

    /// Hand the outbox and a snapshot to the progress hook, if any
    fn report_progress(&mut self) {
        if self.progress.is_none() {
            return;
        }
        let statuses = std::mem::take(&mut self.outbox);
        let snapshot = self.snapshot();
        if let Some(hook) = self.progress.as_mut() {
            hook(statuses, snapshot);
        }
    }

    fn reject(&mut self, action: &str, error: SessionError) -> CommandReply {
        warn!("Rejected command '{}': {}", action, error);
        self.outbox.push(SessionStatus::CommandRejected {
            action: action.to_string(),
            reason: error.to_string(),
        });
        CommandReply::rejected(action, self.state, &error)
    }

    fn set_state(&mut self, to: SessionState) {
        let from = self.state;
        self.state = to;
        self.indicator.set_indicator(to.indicator());

        if from != to {
            info!("Session {:?} -> {:?}", from, to);
            self.outbox.push(SessionStatus::StateChanged { from, to });
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::indicator::Indicator;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    #[derive(Default)]
    pub(crate) struct CameraLog {
        pub open: bool,
        pub opens: u32,
        pub releases: u32,
        pub captures: u32,
        pub fail_open: bool,
        pub script: VecDeque<Result<(), CaptureError>>,
    }

    pub(crate) struct FakeCamera(pub Arc<Mutex<CameraLog>>);

    impl CaptureSource for FakeCamera {
        fn open(&mut self) -> Result<(), CaptureError> {
            let mut log = self.0.lock().unwrap();
            if log.fail_open {
                return Err(CaptureError::DeviceFault("no camera".to_string()));
            }
            log.open = true;
            log.opens += 1;
            Ok(())
        }

        fn capture_still(&mut self) -> Result<Frame, CaptureError> {
            let mut log = self.0.lock().unwrap();
            assert!(log.open, "capture issued while camera closed");
            log.captures += 1;
            log.script.pop_front().unwrap_or(Ok(()))?;
            Ok(Frame::new(vec![log.captures as u8], 1, 1))
        }

        fn release(&mut self) {
            let mut log = self.0.lock().unwrap();
            if log.open {
                log.releases += 1;
            }
            log.open = false;
        }

        fn is_open(&self) -> bool {
            self.0.lock().unwrap().open
        }
    }

    #[derive(Default)]
    pub(crate) struct EncoderLog {
        pub sessions: Vec<Uuid>,
        /// Frames submitted to the currently open pipeline
        pub submitted: Vec<Vec<u8>>,
        pub artifacts: Vec<Vec<Vec<u8>>>,
        pub aborted: u32,
        pub fail_submit: bool,
        pub fail_finish: bool,
        pub finish_delay: Duration,
    }

    pub(crate) struct FakeEncoders(pub Arc<Mutex<EncoderLog>>);

    struct FakePipeline {
        log: Arc<Mutex<EncoderLog>>,
        frames: Vec<Vec<u8>>,
    }

    impl EncoderFactory for FakeEncoders {
        fn create(&mut self, session_id: Uuid) -> Result<Box<dyn EncoderPipeline>, EncoderError> {
            let mut log = self.0.lock().unwrap();
            log.sessions.push(session_id);
            log.submitted.clear();
            Ok(Box::new(FakePipeline {
                log: self.0.clone(),
                frames: Vec::new(),
            }))
        }
    }

    impl EncoderPipeline for FakePipeline {
        fn submit(&mut self, frame: &Frame) -> Result<(), EncoderError> {
            let mut log = self.log.lock().unwrap();
            if log.fail_submit {
                return Err(EncoderError::EncodeFault("disk full".to_string()));
            }
            log.submitted.push(frame.data.to_vec());
            self.frames.push(frame.data.to_vec());
            Ok(())
        }

        fn frame_count(&self) -> u64 {
            self.frames.len() as u64
        }

        fn finish(self: Box<Self>) -> Result<Artifact, EncoderError> {
            let delay = self.log.lock().unwrap().finish_delay;
            std::thread::sleep(delay);

            let mut log = self.log.lock().unwrap();
            if log.fail_finish {
                return Err(EncoderError::EncodeFault("ffmpeg crashed".to_string()));
            }
            if self.frames.is_empty() {
                return Err(EncoderError::NoFrames);
            }
            log.artifacts.push(self.frames.clone());
            Ok(Artifact {
                path: PathBuf::from(format!("/tmp/lapse-{}.mp4", log.artifacts.len())),
                frame_count: self.frames.len() as u64,
                size_bytes: 0,
                sha256: String::new(),
            })
        }

        fn abort(self: Box<Self>) {
            self.log.lock().unwrap().aborted += 1;
        }
    }

    pub(crate) struct FakeIndicator(pub Arc<Mutex<Vec<Indicator>>>);

    impl IndicatorOutput for FakeIndicator {
        fn set_indicator(&mut self, indicator: Indicator) {
            self.0.lock().unwrap().push(indicator);
        }
    }

    pub(crate) struct Rig {
        pub orchestrator: Orchestrator,
        pub camera: Arc<Mutex<CameraLog>>,
        pub encoder: Arc<Mutex<EncoderLog>>,
        pub lights: Arc<Mutex<Vec<Indicator>>>,
    }

    impl Rig {
        pub fn indicator(&self) -> Indicator {
            *self.lights.lock().unwrap().last().unwrap()
        }

        pub fn camera_open(&self) -> bool {
            self.camera.lock().unwrap().open
        }
    }

    pub(crate) fn settings(interval_ms: u64, threshold: u32) -> OrchestratorSettings {
        OrchestratorSettings {
            capture_interval: Duration::from_millis(interval_ms),
            failure_threshold: threshold,
            auto_start_on_print: true,
            pause_with_printer: true,
            stop_with_printer: true,
        }
    }

    pub(crate) fn rig_with(settings: OrchestratorSettings) -> Rig {
        let camera = Arc::new(Mutex::new(CameraLog::default()));
        let encoder = Arc::new(Mutex::new(EncoderLog::default()));
        let lights = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::new(
            settings,
            Box::new(FakeCamera(camera.clone())),
            Box::new(FakeEncoders(encoder.clone())),
            Box::new(FakeIndicator(lights.clone())),
        );
        Rig {
            orchestrator,
            camera,
            encoder,
            lights,
        }
    }

    pub(crate) fn rig() -> Rig {
        rig_with(settings(1000, 5))
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    const ALL_ACTIONS: [&str; 5] = ["start", "stop", "pause", "resume", "acknowledge"];

    /// Drive a fresh rig into each reachable resting state
    fn rigs_in_every_state() -> Vec<Rig> {
        let idle = rig();

        let mut capturing = rig();
        capturing.orchestrator.handle_command(&Command::new("start"));

        let mut paused = rig();
        paused.orchestrator.handle_command(&Command::new("start"));
        paused.orchestrator.handle_command(&Command::new("pause"));

        let mut errored = rig();
        errored.camera.lock().unwrap().fail_open = true;
        errored.orchestrator.handle_command(&Command::new("start"));

        vec![idle, capturing, paused, errored]
    }

    #[test]
    fn test_illegal_commands_never_mutate_state() {
        for mut rig in rigs_in_every_state() {
            let state = rig.orchestrator.state();
            for action in ALL_ACTIONS {
                let parsed: CommandAction = action.parse().unwrap();
                if state.accepts(parsed) {
                    continue;
                }
                let lights_before = rig.lights.lock().unwrap().len();
                let snapshot_before = rig.orchestrator.snapshot();

                let reply = rig.orchestrator.handle_command(&Command::new(action));

                assert!(!reply.accepted, "{} accepted in {:?}", action, state);
                assert_eq!(reply.error, Some("illegal_transition"));
                assert_eq!(rig.orchestrator.state(), state);
                assert_eq!(rig.orchestrator.snapshot(), snapshot_before);
                assert_eq!(rig.lights.lock().unwrap().len(), lights_before);
            }
        }
    }

    #[test]
    fn test_resume_while_idle_is_rejected() {
        let mut rig = rig();
        let indicator_before = rig.indicator();

        let reply = rig.orchestrator.handle_command(&Command::new("resume"));

        assert!(!reply.accepted);
        assert_eq!(reply.state, SessionState::Idle);
        assert!(reply.reason.contains("resume"));
        assert_eq!(rig.indicator(), indicator_before);
        assert!(matches!(
            rig.orchestrator.drain_statuses().as_slice(),
            [SessionStatus::CommandRejected { .. }]
        ));
    }

    #[test]
    fn test_unknown_action_is_invalid_command() {
        let mut rig = rig();
        let reply = rig.orchestrator.handle_command(&Command::new("home"));
        assert!(!reply.accepted);
        assert_eq!(reply.error, Some("invalid_command"));
        assert_eq!(rig.orchestrator.state(), SessionState::Idle);
    }

    #[test]
    fn test_stale_printer_notifications_ignored() {
        let mut rig = rig();
        rig.orchestrator
            .handle_printer_status(PrinterState::new(PrinterPhase::Idle, 5))
            .unwrap();

        // delayed "printing" arriving after the newer "idle"
        let err = rig
            .orchestrator
            .handle_printer_status(PrinterState::new(PrinterPhase::Printing, 4))
            .unwrap_err();
        assert_eq!(err.kind(), "stale_notification");

        let dup = rig
            .orchestrator
            .handle_printer_status(PrinterState::new(PrinterPhase::Printing, 5));
        assert!(dup.is_err());

        let snapshot = rig.orchestrator.snapshot();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.printer, Some(PrinterState::new(PrinterPhase::Idle, 5)));
        assert_eq!(snapshot.stale_notifications, 2);
    }

    #[test]
    fn test_one_frame_per_successful_tick_and_none_while_paused() {
        let mut rig = rig();
        let t0 = Instant::now();

        assert!(!rig.orchestrator.tick(t0));
        assert_eq!(rig.camera.lock().unwrap().captures, 0);

        rig.orchestrator.handle_command(&Command::new("start"));
        assert!(rig.orchestrator.tick(t0));
        // interval not yet elapsed
        assert!(!rig.orchestrator.tick(t0 + ms(500)));
        assert!(rig.orchestrator.tick(t0 + ms(1000)));
        assert_eq!(rig.encoder.lock().unwrap().submitted.len(), 2);

        rig.orchestrator.handle_command(&Command::new("pause"));
        assert_eq!(rig.indicator(), Indicator::Paused);
        for i in 2..6 {
            assert!(!rig.orchestrator.tick(t0 + ms(1000 * i)));
        }
        assert_eq!(rig.encoder.lock().unwrap().submitted.len(), 2);

        // resume captures on the very next tick
        rig.orchestrator.handle_command(&Command::new("resume"));
        assert!(rig.orchestrator.tick(t0 + ms(6100)));
        assert_eq!(rig.encoder.lock().unwrap().submitted.len(), 3);
        assert_eq!(rig.orchestrator.snapshot().frame_count, 3);
    }

    #[test]
    fn test_press_round_trip_produces_one_artifact() {
        let mut rig = rig();
        let t0 = Instant::now();

        rig.orchestrator.handle_button_edge(ButtonEdge::press(t0));
        rig.orchestrator.handle_button_edge(ButtonEdge::release(t0 + ms(100)));
        assert_eq!(rig.orchestrator.state(), SessionState::Capturing);
        assert_eq!(rig.indicator(), Indicator::Recording);
        assert!(rig.camera_open());

        let n = 7;
        for i in 0..n {
            assert!(rig.orchestrator.tick(t0 + ms(1000 * i)));
        }

        rig.orchestrator.handle_button_edge(ButtonEdge::press(t0 + ms(10_000)));
        assert_eq!(rig.orchestrator.state(), SessionState::Idle);
        assert_eq!(rig.indicator(), Indicator::Idle);
        assert!(!rig.camera_open());

        let encoder = rig.encoder.lock().unwrap();
        assert_eq!(encoder.artifacts.len(), 1);
        assert_eq!(encoder.artifacts[0].len(), n as usize);

        let statuses = rig.orchestrator.drain_statuses();
        assert!(statuses.iter().any(|s| matches!(
            s,
            SessionStatus::StateChanged { from: SessionState::Capturing, to: SessionState::Finalizing }
        )));
        assert!(statuses.iter().any(|s| matches!(
            s,
            SessionStatus::Completed { artifact: Some(_), frame_count: 7, .. }
        )));
    }

    #[test]
    fn test_progress_hook_sees_finalizing_before_finish() {
        let mut rig = rig();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let encoder = rig.encoder.clone();
        rig.orchestrator
            .set_progress_hook(Box::new(move |statuses, snapshot| {
                // nothing has been encoded yet
                assert!(encoder.lock().unwrap().artifacts.is_empty());
                sink.lock().unwrap().push((statuses, snapshot));
            }));

        rig.orchestrator.handle_command(&Command::new("start"));
        rig.orchestrator.tick(Instant::now());
        rig.orchestrator.handle_command(&Command::new("stop"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (statuses, snapshot) = &seen[0];
        assert_eq!(snapshot.state, SessionState::Finalizing);
        assert_eq!(snapshot.frame_count, 1);
        assert!(statuses.iter().any(|s| matches!(
            s,
            SessionStatus::StateChanged { to: SessionState::Finalizing, .. }
        )));
        assert!(statuses
            .iter()
            .any(|s| matches!(s, SessionStatus::FrameCaptured { width: 1, height: 1, .. })));

        // the remaining statuses stay queued for the engine
        let rest = rig.orchestrator.drain_statuses();
        assert!(rest
            .iter()
            .any(|s| matches!(s, SessionStatus::Completed { artifact: Some(_), .. })));
        assert!(!rest
            .iter()
            .any(|s| matches!(s, SessionStatus::FrameCaptured { .. })));
    }

    #[test]
    fn test_three_ticks_yield_frames_in_capture_order() {
        let mut rig = rig_with(settings(1000, 5));
        let t0 = Instant::now();
        rig.orchestrator.handle_command(&Command::new("start"));

        for i in 0..3 {
            assert!(rig.orchestrator.tick(t0 + ms(1000 * i)));
        }
        let reply = rig.orchestrator.handle_command(&Command::new("stop"));
        assert!(reply.accepted);
        assert_eq!(reply.state, SessionState::Idle);

        let encoder = rig.encoder.lock().unwrap();
        assert_eq!(encoder.artifacts[0], vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_failure_threshold_enters_error_and_releases_camera() {
        let mut rig = rig_with(settings(1000, 5));
        let t0 = Instant::now();
        rig.orchestrator.handle_command(&Command::new("start"));
        {
            let mut camera = rig.camera.lock().unwrap();
            for _ in 0..5 {
                camera.script.push_back(Err(CaptureError::Timeout));
            }
        }

        for i in 0..4 {
            assert!(!rig.orchestrator.tick(t0 + ms(i)));
            assert_eq!(rig.orchestrator.state(), SessionState::Capturing);
        }
        assert!(!rig.orchestrator.tick(t0 + ms(4)));

        assert_eq!(rig.orchestrator.state(), SessionState::Error);
        assert_eq!(rig.indicator(), Indicator::Error);
        assert!(!rig.camera_open());
        assert_eq!(rig.camera.lock().unwrap().releases, 1);
        assert_eq!(rig.orchestrator.snapshot().consecutive_failures, 5);

        // acknowledgement returns to idle with counters reset
        let reply = rig.orchestrator.handle_command(&Command::new("ack"));
        assert!(reply.accepted);
        let snapshot = rig.orchestrator.snapshot();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.total_failures, 0);
        assert_eq!(rig.indicator(), Indicator::Idle);
    }

    #[test]
    fn test_single_failure_retried_on_next_tick() {
        let mut rig = rig();
        let t0 = Instant::now();
        rig.orchestrator.handle_command(&Command::new("start"));
        rig.camera
            .lock()
            .unwrap()
            .script
            .push_back(Err(CaptureError::DeviceBusy));

        assert!(!rig.orchestrator.tick(t0));
        assert!(rig.orchestrator.tick(t0 + ms(10)));

        let snapshot = rig.orchestrator.snapshot();
        assert_eq!(snapshot.state, SessionState::Capturing);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.total_failures, 1);
        assert_eq!(snapshot.frame_count, 1);
    }

    #[test]
    fn test_capture_failures_salvage_recorded_frames() {
        let mut rig = rig_with(settings(1000, 2));
        let t0 = Instant::now();
        rig.orchestrator.handle_command(&Command::new("start"));
        assert!(rig.orchestrator.tick(t0));
        {
            let mut camera = rig.camera.lock().unwrap();
            camera.script.push_back(Err(CaptureError::DeviceFault("x".into())));
            camera.script.push_back(Err(CaptureError::DeviceFault("x".into())));
        }
        rig.orchestrator.tick(t0 + ms(1000));
        rig.orchestrator.tick(t0 + ms(1001));

        assert_eq!(rig.orchestrator.state(), SessionState::Error);
        assert_eq!(rig.encoder.lock().unwrap().artifacts.len(), 1);
        assert!(rig.orchestrator.snapshot().last_artifact.is_some());
    }

    #[test]
    fn test_encode_fault_on_submit_is_fatal() {
        let mut rig = rig();
        rig.orchestrator.handle_command(&Command::new("start"));
        rig.encoder.lock().unwrap().fail_submit = true;

        assert!(!rig.orchestrator.tick(Instant::now()));
        assert_eq!(rig.orchestrator.state(), SessionState::Error);
        assert_eq!(rig.encoder.lock().unwrap().aborted, 1);
        assert!(!rig.camera_open());
    }

    #[test]
    fn test_encode_fault_on_finish_is_fatal() {
        let mut rig = rig();
        rig.orchestrator.handle_command(&Command::new("start"));
        rig.orchestrator.tick(Instant::now());
        rig.encoder.lock().unwrap().fail_finish = true;

        let reply = rig.orchestrator.handle_command(&Command::new("stop"));
        assert!(reply.accepted);
        assert_eq!(reply.state, SessionState::Error);
        assert_eq!(rig.indicator(), Indicator::Error);
        assert!(!rig.camera_open());
    }

    #[test]
    fn test_session_without_frames_completes_without_artifact() {
        let mut rig = rig();
        rig.orchestrator.handle_command(&Command::new("start"));
        rig.orchestrator.drain_statuses();

        rig.orchestrator.handle_command(&Command::new("stop"));

        assert_eq!(rig.orchestrator.state(), SessionState::Idle);
        assert!(rig.encoder.lock().unwrap().artifacts.is_empty());
        assert!(rig
            .orchestrator
            .drain_statuses()
            .iter()
            .any(|s| matches!(s, SessionStatus::Completed { artifact: None, .. })));
    }

    #[test]
    fn test_camera_open_failure_rejects_start() {
        let mut rig = rig();
        rig.camera.lock().unwrap().fail_open = true;

        let reply = rig.orchestrator.handle_command(&Command::new("start"));

        assert!(!reply.accepted);
        assert_eq!(reply.error, Some("start_failed"));
        assert_eq!(rig.orchestrator.state(), SessionState::Error);
        assert_eq!(rig.indicator(), Indicator::Error);
        assert!(rig.encoder.lock().unwrap().sessions.is_empty());
    }

    #[test]
    fn test_finalize_from_every_state() {
        for mut rig in rigs_in_every_state() {
            // last capture in flight failed
            rig.camera
                .lock()
                .unwrap()
                .script
                .push_back(Err(CaptureError::Timeout));
            rig.orchestrator.tick(Instant::now());

            let snapshot = rig.orchestrator.finalize();
            assert_eq!(snapshot.state, SessionState::Idle);
            assert!(!snapshot.camera_open);
            assert!(!rig.camera_open());

            // repeat calls are no-ops
            let lights = rig.lights.lock().unwrap().len();
            assert_eq!(rig.orchestrator.finalize().state, SessionState::Idle);
            assert_eq!(rig.lights.lock().unwrap().len(), lights);
        }
    }

    #[test]
    fn test_redelivered_press_is_ignored() {
        let mut rig = rig();
        let t0 = Instant::now();

        rig.orchestrator.handle_button_edge(ButtonEdge::press(t0));
        rig.orchestrator.handle_button_edge(ButtonEdge::press(t0));
        assert_eq!(rig.orchestrator.state(), SessionState::Capturing);
        assert_eq!(rig.encoder.lock().unwrap().sessions.len(), 1);
    }

    #[test]
    fn test_press_while_paused_finalizes_and_ignored_in_error() {
        let mut rig = rig();
        let t0 = Instant::now();
        rig.orchestrator.handle_command(&Command::new("start"));
        rig.orchestrator.handle_command(&Command::new("pause"));

        rig.orchestrator.handle_button_edge(ButtonEdge::press(t0));
        assert_eq!(rig.orchestrator.state(), SessionState::Idle);

        rig.camera.lock().unwrap().fail_open = true;
        rig.orchestrator.handle_button_edge(ButtonEdge::press(t0 + ms(500)));
        assert_eq!(rig.orchestrator.state(), SessionState::Error);
        rig.orchestrator.handle_button_edge(ButtonEdge::press(t0 + ms(900)));
        assert_eq!(rig.orchestrator.state(), SessionState::Error);
    }

    #[test]
    fn test_printer_brackets_print_job() {
        let mut rig = rig();
        let t0 = Instant::now();
        let mut seq = 0;
        let mut notify = |rig: &mut Rig, phase| {
            seq += 1;
            rig.orchestrator
                .handle_printer_status(PrinterState::new(phase, seq))
                .unwrap()
        };

        assert_eq!(notify(&mut rig, PrinterPhase::Idle), SessionState::Idle);
        assert_eq!(notify(&mut rig, PrinterPhase::Printing), SessionState::Capturing);
        assert_eq!(rig.orchestrator.snapshot().trigger, Some(Trigger::Printer));
        rig.orchestrator.tick(t0);

        assert_eq!(notify(&mut rig, PrinterPhase::Paused), SessionState::Paused);
        assert_eq!(notify(&mut rig, PrinterPhase::Printing), SessionState::Capturing);
        rig.orchestrator.tick(t0 + ms(100));

        assert_eq!(notify(&mut rig, PrinterPhase::Idle), SessionState::Idle);
        assert_eq!(rig.encoder.lock().unwrap().artifacts[0].len(), 2);
    }

    #[test]
    fn test_printer_going_offline_stops_capture() {
        let mut rig = rig();
        rig.orchestrator
            .handle_printer_status(PrinterState::new(PrinterPhase::Printing, 1))
            .unwrap();
        assert_eq!(rig.orchestrator.state(), SessionState::Capturing);

        rig.orchestrator
            .handle_printer_status(PrinterState::new(PrinterPhase::Offline, 2))
            .unwrap();
        assert_eq!(rig.orchestrator.state(), SessionState::Idle);
    }

    #[test]
    fn test_printer_coupling_can_be_disabled() {
        let mut s = settings(1000, 5);
        s.auto_start_on_print = false;
        s.pause_with_printer = false;
        let mut rig = rig_with(s);

        rig.orchestrator
            .handle_printer_status(PrinterState::new(PrinterPhase::Printing, 1))
            .unwrap();
        assert_eq!(rig.orchestrator.state(), SessionState::Idle);

        rig.orchestrator.handle_command(&Command::new("start"));
        rig.orchestrator
            .handle_printer_status(PrinterState::new(PrinterPhase::Paused, 2))
            .unwrap();
        assert_eq!(rig.orchestrator.state(), SessionState::Capturing);
    }

    #[test]
    fn test_manual_stop_overrides_printing_printer() {
        let mut rig = rig();
        rig.orchestrator
            .handle_printer_status(PrinterState::new(PrinterPhase::Printing, 1))
            .unwrap();
        assert_eq!(rig.orchestrator.state(), SessionState::Capturing);

        let reply = rig.orchestrator.handle_command(&Command::new("stop"));
        assert!(reply.accepted);
        assert_eq!(rig.orchestrator.state(), SessionState::Idle);

        // printer still printing, no new edge, no restart
        rig.orchestrator
            .handle_printer_status(PrinterState::new(PrinterPhase::Printing, 2))
            .unwrap();
        assert_eq!(rig.orchestrator.state(), SessionState::Idle);
    }

    #[test]
    fn test_start_interval_override() {
        let mut rig = rig_with(settings(10_000, 5));
        let t0 = Instant::now();
        rig.orchestrator
            .handle_command(&Command::new("start").with_arg("interval_ms", 100));
        assert_eq!(rig.orchestrator.snapshot().capture_interval_ms, Some(100));

        assert!(rig.orchestrator.tick(t0));
        assert!(rig.orchestrator.tick(t0 + ms(100)));
    }

    #[test]
    fn test_release_reasserts_indicator_only() {
        let mut rig = rig();
        rig.orchestrator.handle_command(&Command::new("start"));
        rig.orchestrator.drain_statuses();

        rig.orchestrator
            .handle_button_edge(ButtonEdge::release(Instant::now()));
        assert_eq!(rig.orchestrator.state(), SessionState::Capturing);
        assert_eq!(rig.indicator(), Indicator::Recording);
        assert!(rig.orchestrator.drain_statuses().is_empty());
    }
}
