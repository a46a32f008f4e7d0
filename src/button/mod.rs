//! Capture button
//!
//! Backends push raw press/release edges from their own threads. A single
//! forwarding task debounces them and hands them to the session engine.

mod backend;
pub(crate) mod keyboard_backend;

#[cfg(target_os = "linux")]
pub(crate) mod evdev_backend;

pub use backend::*;

use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::session::SessionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Press,
    Release,
}

/// One button transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonEdge {
    pub kind: EdgeKind,
    pub timestamp: Instant,
}

impl ButtonEdge {
    pub fn press(timestamp: Instant) -> Self {
        Self {
            kind: EdgeKind::Press,
            timestamp,
        }
    }

    pub fn release(timestamp: Instant) -> Self {
        Self {
            kind: EdgeKind::Release,
            timestamp,
        }
    }
}

/// Drops contact bounce.
///
/// An edge is dropped when it arrives within `window` of the last accepted
/// edge, or when it repeats the level the contact is already at. The level
/// follows every raw edge, so a release swallowed as bounce still lets the
/// next real press through.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last_accepted: Option<Instant>,
    level: Option<EdgeKind>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_accepted: None,
            level: None,
        }
    }

    pub fn accept(&mut self, edge: ButtonEdge) -> bool {
        let repeated = self.level == Some(edge.kind);
        self.level = Some(edge.kind);
        if repeated {
            return false;
        }

        if let Some(last) = self.last_accepted {
            if edge.timestamp.saturating_duration_since(last) < self.window {
                return false;
            }
        }
        self.last_accepted = Some(edge.timestamp);
        true
    }
}

/// Start the backend and forward debounced edges to the engine
pub fn spawn_button_source(
    mut backend: Box<dyn ButtonBackend>,
    debounce: Duration,
    session: SessionHandle,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    backend.start(tx)?;
    info!("Button source started ({})", backend.name());

    tokio::spawn(async move {
        // keep the backend alive as long as edges are forwarded
        let _backend = backend;
        let mut debouncer = Debouncer::new(debounce);

        while let Some(edge) = rx.recv().await {
            if !debouncer.accept(edge) {
                debug!("Debounced {:?}", edge.kind);
                continue;
            }
            if session.button_edge(edge).await.is_err() {
                debug!("Session engine gone, stopping button forwarder");
                break;
            }
        }
    });

    Ok(())
}
