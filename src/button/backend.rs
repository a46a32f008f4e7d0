//! Button backend trait

use anyhow::Result;
use tokio::sync::mpsc;

use super::ButtonEdge;
use crate::config::{ButtonBackendKind, ButtonConfig};

/// Trait for button backends
pub trait ButtonBackend: Send {
    /// Start delivering edges to the provided channel
    fn start(&mut self, tx: mpsc::UnboundedSender<ButtonEdge>) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Create the backend selected by configuration, if any
pub fn create_button_backend(config: &ButtonConfig) -> Result<Option<Box<dyn ButtonBackend>>> {
    match config.backend {
        ButtonBackendKind::None => Ok(None),
        ButtonBackendKind::Keyboard => {
            tracing::info!("Using keyboard key {} as capture button", config.key_name);
            Ok(Some(Box::new(super::keyboard_backend::KeyboardBackend::new(
                &config.key_name,
            ))))
        }
        #[cfg(target_os = "linux")]
        ButtonBackendKind::Evdev => {
            let backend = super::evdev_backend::EvdevBackend::open(&config.device, config.key_code)?;
            tracing::info!("Using evdev device {:?} as capture button", config.device);
            Ok(Some(Box::new(backend)))
        }
        #[cfg(not(target_os = "linux"))]
        ButtonBackendKind::Evdev => {
            anyhow::bail!("evdev button backend is only available on Linux")
        }
    }
}
