//! Indicator lights
//!
//! The rig has no display, so three lights are the only local feedback.
//! Setting an indicator never fails from the caller's point of view: driver
//! errors are logged and swallowed.

mod gpio;

pub use gpio::GpioIndicators;

use serde::Serialize;
use tracing::info;

use crate::config::IndicatorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    Idle,
    Recording,
    Paused,
    Error,
}

impl Indicator {
    /// Which of the (red, yellow, green) lights are lit
    pub fn lights(self) -> (bool, bool, bool) {
        match self {
            Indicator::Idle => (false, false, true),
            Indicator::Recording => (true, false, false),
            Indicator::Paused => (false, true, false),
            Indicator::Error => (true, true, false),
        }
    }
}

pub trait IndicatorOutput: Send {
    fn set_indicator(&mut self, indicator: Indicator);
}

/// Indicator output for rigs without lights
#[derive(Debug, Default)]
pub struct LogIndicators {
    current: Option<Indicator>,
}

impl IndicatorOutput for LogIndicators {
    fn set_indicator(&mut self, indicator: Indicator) {
        if self.current != Some(indicator) {
            info!("Indicator -> {:?}", indicator);
            self.current = Some(indicator);
        }
    }
}

/// Build the indicator output selected by configuration
pub fn create_indicator_output(config: &IndicatorConfig) -> Box<dyn IndicatorOutput> {
    if config.gpio_enabled {
        match GpioIndicators::new(config) {
            Ok(leds) => {
                info!("Using GPIO indicator lights");
                return Box::new(leds);
            }
            Err(e) => {
                tracing::warn!("GPIO indicators unavailable ({:#}), falling back to log output", e);
            }
        }
    }
    Box::new(LogIndicators::default())
}
