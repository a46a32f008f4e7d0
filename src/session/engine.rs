//! Session engine
//!
//! Serializes every input to the orchestrator through one bounded channel
//! and drives the capture tick. Orchestrator calls block on driver I/O, so
//! they run under `block_in_place`; the multi-threaded runtime keeps the
//! producers (button, printer, remote) responsive meanwhile.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{
    Command, CommandReply, Orchestrator, SessionEvent, SessionSnapshot, SessionStatus,
};
use crate::button::ButtonEdge;
use crate::capture::Frame;
use crate::printer::PrinterState;

const EVENT_QUEUE_DEPTH: usize = 64;
const STATUS_QUEUE_DEPTH: usize = 64;

/// Owns the orchestrator and runs its event loop
pub struct SessionEngine {
    orchestrator: Orchestrator,
    event_rx: mpsc::Receiver<SessionEvent>,
    outlets: Arc<Outlets>,
    tick_interval: Duration,
}

/// Sending halves of everything handles observe
struct Outlets {
    status_tx: broadcast::Sender<SessionStatus>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    preview_tx: watch::Sender<Option<Frame>>,
}

impl Outlets {
    fn publish(
        &self,
        statuses: Vec<SessionStatus>,
        preview: Option<Frame>,
        snapshot: SessionSnapshot,
    ) {
        for status in statuses {
            // no subscribers is fine
            let _ = self.status_tx.send(status);
        }
        if let Some(frame) = preview {
            self.preview_tx.send_replace(Some(frame));
        }
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// Cloneable front door to a running engine
#[derive(Clone)]
pub struct SessionHandle {
    event_tx: mpsc::Sender<SessionEvent>,
    status_tx: broadcast::Sender<SessionStatus>,
    snapshot_rx: watch::Receiver<SessionSnapshot>,
    preview_rx: watch::Receiver<Option<Frame>>,
}

/// Create an engine around `orchestrator` and the handle that feeds it
pub fn create_session_engine(
    mut orchestrator: Orchestrator,
    tick_interval: Duration,
) -> (SessionEngine, SessionHandle) {
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (status_tx, _) = broadcast::channel(STATUS_QUEUE_DEPTH);
    let (snapshot_tx, snapshot_rx) = watch::channel(orchestrator.snapshot());
    let (preview_tx, preview_rx) = watch::channel(None);

    let outlets = Arc::new(Outlets {
        status_tx: status_tx.clone(),
        snapshot_tx,
        preview_tx,
    });

    // Finalizing is published before the encoder blocks the loop
    let progress = outlets.clone();
    orchestrator.set_progress_hook(Box::new(move |statuses, snapshot| {
        progress.publish(statuses, None, snapshot);
    }));

    let engine = SessionEngine {
        orchestrator,
        event_rx,
        outlets,
        tick_interval,
    };
    let handle = SessionHandle {
        event_tx,
        status_tx,
        snapshot_rx,
        preview_rx,
    };
    (engine, handle)
}

impl SessionEngine {
    /// Run until a shutdown event arrives or every handle is dropped.
    /// Either way the orchestrator is finalized before returning.
    pub async fn run(mut self) -> SessionSnapshot {
        info!("Session engine started (tick every {:?})", self.tick_interval);

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                event = self.event_rx.recv() => {
                    let Some(event) = event else {
                        info!("All session handles dropped");
                        break;
                    };
                    if let Some(done) = self.handle_event(event) {
                        let snapshot = self.finalize();
                        let _ = done.send(snapshot.clone());
                        info!("Session engine stopped");
                        return snapshot;
                    }
                }

                _ = ticker.tick() => {
                    let now = std::time::Instant::now();
                    tokio::task::block_in_place(|| self.orchestrator.tick(now));
                    self.publish();
                }
            }
        }

        let snapshot = self.finalize();
        info!("Session engine stopped");
        snapshot
    }

    /// Apply one event. Returns the completion sender when the event asks
    /// the engine to stop.
    fn handle_event(&mut self, event: SessionEvent) -> Option<oneshot::Sender<SessionSnapshot>> {
        let orchestrator = &mut self.orchestrator;
        let mut stop = None;

        match event {
            SessionEvent::Button(edge) => {
                tokio::task::block_in_place(|| orchestrator.handle_button_edge(edge));
            }
            SessionEvent::Printer(update) => {
                if let Err(e) =
                    tokio::task::block_in_place(|| orchestrator.handle_printer_status(update))
                {
                    debug!("Printer notification dropped: {}", e);
                }
            }
            SessionEvent::Command { command, reply } => {
                let outcome = tokio::task::block_in_place(|| orchestrator.handle_command(&command));
                if let Some(reply) = reply {
                    if reply.send(outcome).is_err() {
                        debug!("Command originator went away before the reply");
                    }
                }
            }
            SessionEvent::Shutdown { done } => {
                info!("Shutdown requested");
                stop = Some(done);
            }
        }

        self.publish();
        stop
    }

    fn finalize(&mut self) -> SessionSnapshot {
        let snapshot = tokio::task::block_in_place(|| self.orchestrator.finalize());
        self.publish();
        snapshot
    }

    /// Push pending statuses, the preview frame and a fresh snapshot
    fn publish(&mut self) {
        self.outlets.publish(
            self.orchestrator.drain_statuses(),
            self.orchestrator.take_preview(),
            self.orchestrator.snapshot(),
        );
    }
}

fn engine_gone() -> anyhow::Error {
    anyhow!("Session engine has stopped")
}

impl SessionHandle {
    /// Submit an operator command and wait for its reply
    pub async fn command(&self, command: Command) -> Result<CommandReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.event_tx
            .send(SessionEvent::Command {
                command,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| engine_gone())?;
        reply_rx.await.context("Session engine dropped the command")
    }

    pub async fn button_edge(&self, edge: ButtonEdge) -> Result<()> {
        self.event_tx
            .send(SessionEvent::Button(edge))
            .await
            .map_err(|_| engine_gone())
    }

    pub async fn printer_status(&self, update: PrinterState) -> Result<()> {
        self.event_tx
            .send(SessionEvent::Printer(update))
            .await
            .map_err(|_| engine_gone())
    }

    /// Latest published snapshot, without touching the engine
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Most recent captured frame, if any
    pub fn preview(&self) -> Option<Frame> {
        self.preview_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Finalize and stop the engine loop
    pub async fn shutdown(&self) -> Result<SessionSnapshot> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .event_tx
            .send(SessionEvent::Shutdown { done: done_tx })
            .await
            .is_err()
        {
            warn!("Shutdown requested but the session engine already stopped");
            return Ok(self.snapshot());
        }
        done_rx.await.context("Session engine stopped before finalizing")
    }
}
