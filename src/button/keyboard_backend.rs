//! rdev-based button backend: a keyboard key stands in for the capture
//! button on development machines. Works on Windows, macOS, and Linux (X11).

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{ButtonBackend, ButtonEdge};

pub struct KeyboardBackend {
    key_name: String,
    capturing: Arc<AtomicBool>,
}

impl KeyboardBackend {
    /// `key_name` is the rdev key name, e.g. "F9", "Space" or "KeyB"
    pub fn new(key_name: &str) -> Self {
        Self {
            key_name: key_name.to_string(),
            capturing: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Match an rdev key against a configured name
fn key_matches(key: rdev::Key, name: &str) -> bool {
    format!("{:?}", key).eq_ignore_ascii_case(name)
}

/// Translate one rdev event into a button edge for the configured key
fn edge_for(event_type: &rdev::EventType, key_name: &str, now: Instant) -> Option<ButtonEdge> {
    match event_type {
        rdev::EventType::KeyPress(key) if key_matches(*key, key_name) => {
            Some(ButtonEdge::press(now))
        }
        rdev::EventType::KeyRelease(key) if key_matches(*key, key_name) => {
            Some(ButtonEdge::release(now))
        }
        _ => None,
    }
}

impl ButtonBackend for KeyboardBackend {
    fn start(&mut self, tx: mpsc::UnboundedSender<ButtonEdge>) -> Result<()> {
        if self.capturing.swap(true, Ordering::SeqCst) {
            return Ok(()); // Already capturing
        }

        let capturing = self.capturing.clone();
        let key_name = self.key_name.clone();

        thread::spawn(move || {
            info!("Keyboard button capture started (key {})", key_name);

            let callback = move |event: rdev::Event| {
                if !capturing.load(Ordering::SeqCst) {
                    return;
                }

                if let Some(edge) = edge_for(&event.event_type, &key_name, Instant::now()) {
                    if let Err(e) = tx.send(edge) {
                        debug!("Failed to send button edge: {}", e);
                    }
                }
            };

            // Blocks for the lifetime of the listener
            if let Err(e) = rdev::listen(callback) {
                error!("rdev listen error: {:?}", e);
            }

            info!("Keyboard button capture stopped");
        });

        Ok(())
    }

    fn name(&self) -> &'static str {
        "keyboard"
    }
}

impl Drop for KeyboardBackend {
    fn drop(&mut self) {
        self.capturing.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::button::EdgeKind;

    #[test]
    fn test_only_configured_key_produces_edges() {
        let now = Instant::now();

        let press = edge_for(&rdev::EventType::KeyPress(rdev::Key::F9), "f9", now).unwrap();
        assert_eq!(press.kind, EdgeKind::Press);

        let release = edge_for(&rdev::EventType::KeyRelease(rdev::Key::F9), "F9", now).unwrap();
        assert_eq!(release.kind, EdgeKind::Release);

        assert!(edge_for(&rdev::EventType::KeyPress(rdev::Key::Space), "F9", now).is_none());
        assert!(edge_for(
            &rdev::EventType::MouseMove { x: 1.0, y: 2.0 },
            "F9",
            now
        )
        .is_none());
    }
}
