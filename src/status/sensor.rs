//! Environment sensor (enclosure temperature / humidity)

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EnvironmentReading {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
}

pub trait EnvironmentSensor: Send {
    /// Sample the sensor. Channels that fail to read are None.
    fn read(&mut self) -> EnvironmentReading;
}

/// No sensor fitted
#[derive(Debug, Default)]
pub struct NoSensor;

impl EnvironmentSensor for NoSensor {
    fn read(&mut self) -> EnvironmentReading {
        EnvironmentReading::default()
    }
}

/// Linux IIO humidity/temperature device, e.g. the dht11 driver at
/// `/sys/bus/iio/devices/iio:device0`. Values are exposed in milli-units.
#[derive(Debug)]
pub struct IioSensor {
    dir: PathBuf,
}

impl IioSensor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_milli(&self, channel: &str) -> Option<f64> {
        let path = self.dir.join(channel);
        match read_milli_value(&path) {
            Ok(value) => Some(value),
            Err(e) => {
                // dht11 reads fail intermittently with EIO
                debug!("Sensor read {:?} failed: {}", path, e);
                None
            }
        }
    }
}

impl EnvironmentSensor for IioSensor {
    fn read(&mut self) -> EnvironmentReading {
        EnvironmentReading {
            temperature_c: self.read_milli("in_temp_input"),
            humidity_pct: self.read_milli("in_humidityrelative_input"),
        }
    }
}

fn read_milli_value(path: &Path) -> std::io::Result<f64> {
    let raw = std::fs::read_to_string(path)?;
    let milli: i64 = raw
        .trim()
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(milli as f64 / 1000.0)
}
