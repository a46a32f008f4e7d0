//! Three LEDs driven through the sysfs GPIO interface
//!
//! Pin numbers are sysfs numbers. On recent Raspberry Pi kernels the header
//! pins are offset (e.g. BCM 17 is gpio529), configure accordingly.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Indicator, IndicatorOutput};
use crate::config::IndicatorConfig;

const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

struct LedPin {
    pin: u32,
    value_path: PathBuf,
}

impl LedPin {
    fn export(root: &Path, pin: u32) -> Result<Self> {
        let pin_dir = root.join(format!("gpio{}", pin));
        if !pin_dir.exists() {
            std::fs::write(root.join("export"), pin.to_string())
                .with_context(|| format!("Failed to export gpio{}", pin))?;
            // udev needs a moment to fix up permissions on the new node
            std::thread::sleep(Duration::from_millis(50));
        }

        std::fs::write(pin_dir.join("direction"), "out")
            .with_context(|| format!("Failed to set gpio{} as output", pin))?;

        Ok(Self {
            pin,
            value_path: pin_dir.join("value"),
        })
    }

    fn set(&self, on: bool) -> std::io::Result<()> {
        std::fs::write(&self.value_path, if on { "1" } else { "0" })
    }
}

pub struct GpioIndicators {
    red: LedPin,
    yellow: LedPin,
    green: LedPin,
}

impl GpioIndicators {
    pub fn new(config: &IndicatorConfig) -> Result<Self> {
        Self::with_root(Path::new(SYSFS_GPIO_ROOT), config)
    }

    fn with_root(root: &Path, config: &IndicatorConfig) -> Result<Self> {
        Ok(Self {
            red: LedPin::export(root, config.red_pin)?,
            yellow: LedPin::export(root, config.yellow_pin)?,
            green: LedPin::export(root, config.green_pin)?,
        })
    }
}

impl IndicatorOutput for GpioIndicators {
    fn set_indicator(&mut self, indicator: Indicator) {
        let (red, yellow, green) = indicator.lights();
        debug!("Indicator -> {:?}", indicator);

        for (led, on) in [(&self.red, red), (&self.yellow, yellow), (&self.green, green)] {
            if let Err(e) = led.set(on) {
                warn!("Failed to drive gpio{}: {}", led.pin, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(pins: &[u32]) -> PathBuf {
        let root = std::env::temp_dir().join(format!("printlapse-gpio-{}", uuid::Uuid::new_v4()));
        for pin in pins {
            std::fs::create_dir_all(root.join(format!("gpio{}", pin))).unwrap();
        }
        root
    }

    fn read_value(root: &Path, pin: u32) -> String {
        std::fs::read_to_string(root.join(format!("gpio{}/value", pin))).unwrap()
    }

    #[test]
    fn test_lights_follow_indicator() {
        let config = IndicatorConfig::default();
        let root = fake_sysfs(&[config.red_pin, config.yellow_pin, config.green_pin]);
        let mut leds = GpioIndicators::with_root(&root, &config).unwrap();

        assert_eq!(
            std::fs::read_to_string(root.join(format!("gpio{}/direction", config.red_pin))).unwrap(),
            "out"
        );

        leds.set_indicator(Indicator::Recording);
        assert_eq!(read_value(&root, config.red_pin), "1");
        assert_eq!(read_value(&root, config.yellow_pin), "0");
        assert_eq!(read_value(&root, config.green_pin), "0");

        leds.set_indicator(Indicator::Idle);
        assert_eq!(read_value(&root, config.red_pin), "0");
        assert_eq!(read_value(&root, config.green_pin), "1");

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn test_missing_sysfs_is_an_error() {
        let root = std::env::temp_dir().join(format!("printlapse-nogpio-{}", uuid::Uuid::new_v4()));
        assert!(GpioIndicators::with_root(&root, &IndicatorConfig::default()).is_err());
    }
}
