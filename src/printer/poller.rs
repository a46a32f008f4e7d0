//! HTTP polling of the printer host (Moonraker, OctoPrint, or any endpoint
//! returning the job state as a JSON string)

use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{PhaseTracker, PrinterPhase};
use crate::config::PrinterConfig;
use crate::session::SessionHandle;

/// Extract the phase from a status response body
fn phase_from_body(body: &serde_json::Value, pointer: &str) -> Result<PrinterPhase> {
    let state = body
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .with_context(|| format!("No state string at {} in printer response", pointer))?;

    PrinterPhase::from_state_str(state)
        .with_context(|| format!("Unrecognized printer state '{}'", state))
}

async fn poll_once(client: &Client, url: &str, pointer: &str) -> Result<PrinterPhase> {
    let body: serde_json::Value = client
        .get(url)
        .send()
        .await
        .context("Printer status request failed")?
        .error_for_status()
        .context("Printer status request rejected")?
        .json()
        .await
        .context("Printer status response is not JSON")?;

    phase_from_body(&body, pointer)
}

/// True when the host could not be reached at all. A host that answers,
/// even with an error status or garbage, is reachable.
fn is_unreachable(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
        .any(|e| e.is_connect() || e.is_timeout())
}

/// Holds `Offline` back until enough consecutive polls failed to reach the
/// host, so one dropped request does not end a print's session.
#[derive(Debug)]
struct Reachability {
    offline_after: u32,
    misses: u32,
}

impl Reachability {
    fn new(offline_after: u32) -> Self {
        Self {
            offline_after: offline_after.max(1),
            misses: 0,
        }
    }

    fn reached(&mut self) {
        self.misses = 0;
    }

    /// Count an unreachable poll; returns `Offline` once the limit is hit
    fn missed(&mut self) -> Option<PrinterPhase> {
        self.misses = self.misses.saturating_add(1);
        (self.misses >= self.offline_after).then_some(PrinterPhase::Offline)
    }
}

/// Poll the printer on a fixed interval and push phase changes to the engine.
///
/// Hosts unreachable for `offline_after_polls` polls in a row are reported
/// as `Offline`; error replies and malformed responses keep the last phase.
/// Silence from the printer never stalls the orchestrator, which only
/// reacts to what this task pushes.
pub fn spawn_printer_poller(config: &PrinterConfig, session: SessionHandle) -> Result<bool> {
    let Some(url) = config.status_url.clone() else {
        info!("Printer status polling disabled (no printer.status_url)");
        return Ok(false);
    };

    let client = Client::builder()
        .timeout(Duration::from_millis(config.request_timeout_ms))
        .build()
        .context("Failed to build printer HTTP client")?;
    let pointer = config.state_pointer.clone();
    let interval = Duration::from_millis(config.poll_interval_ms);
    let mut reachability = Reachability::new(config.offline_after_polls);

    info!("Polling printer status at {} every {:?}", url, interval);

    tokio::spawn(async move {
        let mut tracker = PhaseTracker::default();
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;

            let phase = match poll_once(&client, &url, &pointer).await {
                Ok(phase) => {
                    reachability.reached();
                    phase
                }
                Err(e) if is_unreachable(&e) => match reachability.missed() {
                    Some(offline) => offline,
                    None => {
                        debug!(
                            "Printer unreachable ({} in a row, last known {:?}): {:#}",
                            reachability.misses,
                            tracker.current().map(|s| s.phase),
                            e
                        );
                        continue;
                    }
                },
                Err(e) => {
                    warn!("Ignoring printer response: {:#}", e);
                    continue;
                }
            };

            let Some(update) = tracker.observe(phase) else {
                continue;
            };

            info!("Printer phase -> {:?} (seq {})", update.phase, update.sequence);
            if session.printer_status(update).await.is_err() {
                debug!("Session engine gone, stopping printer poller");
                break;
            }
        }
    });

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_moonraker_body() {
        let body = json!({
            "result": { "status": { "print_stats": { "state": "printing", "filename": "benchy.gcode" } } }
        });
        assert_eq!(
            phase_from_body(&body, "/result/status/print_stats/state").unwrap(),
            PrinterPhase::Printing
        );
    }

    #[test]
    fn test_octoprint_body() {
        let body = json!({ "state": "Paused", "job": {} });
        assert_eq!(phase_from_body(&body, "/state").unwrap(), PrinterPhase::Paused);
    }

    #[test]
    fn test_offline_only_after_consecutive_misses() {
        let mut reachability = Reachability::new(3);
        assert_eq!(reachability.missed(), None);
        assert_eq!(reachability.missed(), None);
        // a successful poll resets the streak
        reachability.reached();
        assert_eq!(reachability.missed(), None);
        assert_eq!(reachability.missed(), None);
        assert_eq!(reachability.missed(), Some(PrinterPhase::Offline));
        assert_eq!(reachability.missed(), Some(PrinterPhase::Offline));

        let mut eager = Reachability::new(0);
        assert_eq!(eager.missed(), Some(PrinterPhase::Offline));
    }

    /// Answer a single HTTP request with `response` and close
    async fn serve_once(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/printer/objects/query", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        url
    }

    fn client() -> Client {
        Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_html_reply_keeps_host_reachable() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\ncontent-length: 24\r\nconnection: close\r\n\r\n<html>maintenance</html>",
        )
        .await;

        let err = poll_once(&client(), &url, "/state").await.unwrap_err();
        assert!(!is_unreachable(&err), "{:#}", err);
    }

    #[tokio::test]
    async fn test_server_error_keeps_host_reachable() {
        let url = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;

        let err = poll_once(&client(), &url, "/state").await.unwrap_err();
        assert!(!is_unreachable(&err), "{:#}", err);
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let err = poll_once(&client(), &format!("http://{}/", addr), "/state")
            .await
            .unwrap_err();
        assert!(is_unreachable(&err), "{:#}", err);
    }

    #[test]
    fn test_missing_or_unknown_state() {
        assert!(phase_from_body(&json!({}), "/state").is_err());
        assert!(phase_from_body(&json!({ "state": 3 }), "/state").is_err());
        assert!(phase_from_body(&json!({ "state": "heating" }), "/state").is_err());
    }
}
