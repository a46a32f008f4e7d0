//! Periodic status reports
//!
//! Samples the session snapshot, the enclosure sensor and the latest frame
//! on a fixed interval and republishes them to the log and, when
//! configured, an HTTP endpoint.

mod sensor;

pub use sensor::{EnvironmentReading, EnvironmentSensor, IioSensor, NoSensor};

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use image::ImageFormat;
use reqwest::Client;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::capture::Frame;
use crate::config::StatusConfig;
use crate::session::{SessionHandle, SessionSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub session: SessionSnapshot,
    #[serde(flatten)]
    pub environment: EnvironmentReading,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_jpeg_base64: Option<String>,
}

pub struct StatusReporter {
    device_id: String,
    sensor: Box<dyn EnvironmentSensor>,
    client: Client,
    endpoint: Option<String>,
    interval: Duration,
    /// Thumbnail edge length; None disables previews
    preview_size: Option<u32>,
}

/// Build the enclosure sensor selected by configuration
pub fn create_environment_sensor(config: &StatusConfig) -> Box<dyn EnvironmentSensor> {
    match &config.sensor_path {
        Some(path) => {
            info!("Reading enclosure sensor from {:?}", path);
            Box::new(IioSensor::new(path))
        }
        None => Box::new(NoSensor),
    }
}

impl StatusReporter {
    pub fn new(config: &StatusConfig, sensor: Box<dyn EnvironmentSensor>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build status HTTP client")?;

        Ok(Self {
            device_id: device_id(),
            sensor,
            client,
            endpoint: config.endpoint.clone(),
            interval: Duration::from_millis(config.interval_ms),
            preview_size: config.include_preview.then_some(config.preview_size),
        })
    }

    pub fn build_report(&mut self, session: SessionSnapshot, preview: Option<&Frame>) -> StatusReport {
        let preview_jpeg_base64 = match (self.preview_size, preview) {
            (Some(size), Some(frame)) => match encode_thumbnail(frame, size) {
                Ok(encoded) => Some(encoded),
                Err(e) => {
                    debug!("Skipping preview: {:#}", e);
                    None
                }
            },
            _ => None,
        };

        StatusReport {
            device_id: self.device_id.clone(),
            timestamp: Utc::now(),
            session,
            environment: self.sensor.read(),
            preview_jpeg_base64,
        }
    }

    /// Report on the configured interval for as long as the runtime lives
    pub fn spawn(mut self, session: SessionHandle) {
        info!(
            "Status reports every {:?}{}",
            self.interval,
            self.endpoint
                .as_deref()
                .map(|e| format!(" to {}", e))
                .unwrap_or_default()
        );

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;

                let snapshot = session.snapshot();
                let preview = session.preview();
                let report =
                    tokio::task::block_in_place(|| self.build_report(snapshot, preview.as_ref()));

                if let Err(e) = publish(&self.client, self.endpoint.as_deref(), &report).await {
                    warn!("{:#}", e);
                }
            }
        });
    }
}

/// Log a report and POST it to `endpoint` when one is configured
async fn publish(client: &Client, endpoint: Option<&str>, report: &StatusReport) -> Result<()> {
    debug!(
        "Status: {:?} frames={} temp={:?} humidity={:?}",
        report.session.state,
        report.session.frame_count,
        report.environment.temperature_c,
        report.environment.humidity_pct
    );

    let Some(endpoint) = endpoint else {
        return Ok(());
    };

    client
        .post(endpoint)
        .json(report)
        .send()
        .await
        .context("Failed to send status report")?
        .error_for_status()
        .context("Status endpoint rejected report")?;
    Ok(())
}

/// Stable, non-reversible identifier for this rig
pub fn device_id() -> String {
    match machine_uid::get() {
        Ok(uid) => {
            let digest = Sha256::digest(uid.trim().as_bytes());
            hex::encode(&digest[..8])
        }
        Err(e) => {
            warn!("Could not read machine id: {}", e);
            "unknown-device".to_string()
        }
    }
}

/// Downscale a frame to fit `size`×`size` and return it as base64 JPEG
fn encode_thumbnail(frame: &Frame, size: u32) -> Result<String> {
    let image = image::load_from_memory(&frame.data).context("Frame is not a decodable image")?;
    let thumbnail = image.thumbnail(size, size).to_rgb8();

    let mut jpeg = Vec::new();
    thumbnail
        .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .context("Failed to encode preview")?;

    Ok(base64::engine::general_purpose::STANDARD.encode(jpeg))
}
