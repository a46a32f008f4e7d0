//! evdev button backend for Linux
//!
//! A GPIO push button wired through the `gpio-keys` device tree overlay
//! shows up as an input device emitting a single key code.
//! Requires the user to be in the 'input' group.

use anyhow::{Context, Result};
use evdev::{Device, InputEventKind, Key};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ButtonBackend, ButtonEdge};

pub struct EvdevBackend {
    device: Option<Device>,
    key: Key,
    running: Arc<AtomicBool>,
}

impl EvdevBackend {
    pub fn open(path: &Path, key_code: u16) -> Result<Self> {
        let device = Device::open(path)
            .with_context(|| format!("Failed to open button device {:?}", path))?;

        let key = Key::new(key_code);
        let supported = device
            .supported_keys()
            .map(|keys| keys.contains(key))
            .unwrap_or(false);
        if !supported {
            warn!(
                "{} ({:?}) does not advertise {:?}, listening anyway",
                device.name().unwrap_or("Unknown"),
                path,
                key
            );
        }

        Ok(Self {
            device: Some(device),
            key,
            running: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl ButtonBackend for EvdevBackend {
    fn start(&mut self, tx: mpsc::UnboundedSender<ButtonEdge>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut device = self
            .device
            .take()
            .context("evdev button backend already consumed")?;
        let running = self.running.clone();
        let key = self.key;

        thread::spawn(move || {
            let device_name = device.name().unwrap_or("Unknown").to_string();
            info!("Started evdev button capture for: {}", device_name);

            while running.load(Ordering::SeqCst) {
                match device.fetch_events() {
                    Ok(events) => {
                        for ev in events {
                            let InputEventKind::Key(code) = ev.kind() else {
                                continue;
                            };
                            if code != key {
                                continue;
                            }

                            let edge = match ev.value() {
                                1 => ButtonEdge::press(Instant::now()),
                                0 => ButtonEdge::release(Instant::now()),
                                // autorepeat
                                _ => continue,
                            };

                            if tx.send(edge).is_err() {
                                debug!("Button receiver dropped, stopping evdev capture");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("evdev fetch error for {}: {}", device_name, e);
                        thread::sleep(std::time::Duration::from_millis(100));
                    }
                }
            }

            info!("Stopped evdev button capture for: {}", device_name);
        });

        Ok(())
    }

    fn name(&self) -> &'static str {
        "evdev"
    }
}

impl Drop for EvdevBackend {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
