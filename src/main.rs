//! printlapse rig agent
//!
//! Records a timelapse of a 3D-print job: a capture button, the printer's
//! job state and remote operator commands drive one recording session that
//! captures stills on a timer and encodes them into a video.

mod button;
mod capture;
mod config;
mod encoder;
mod indicator;
mod logging;
mod printer;
mod process;
mod remote;
mod session;
mod status;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use button::{create_button_backend, spawn_button_source};
use capture::StillCommandCamera;
use config::Config;
use encoder::FfmpegEncoderFactory;
use indicator::create_indicator_output;
use printer::spawn_printer_poller;
use remote::spawn_command_channel;
use session::{create_session_engine, Orchestrator, OrchestratorSettings, SessionHandle};
use status::{create_environment_sensor, StatusReporter};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config_override = match args.iter().position(|a| a == "--config" || a == "-c") {
        Some(i) => Some(PathBuf::from(
            args.get(i + 1).context("--config requires a path")?,
        )),
        None => None,
    };
    let print_config = args.iter().any(|a| a == "--print-config");

    let _log_guard = logging::init_logging()?;
    info!("printlapse starting...");
    info!("Logs in {:?}", logging::get_log_dir()?);

    let config = match &config_override {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded from {:?}", config.config_path()?);

    if print_config {
        println!(
            "{}",
            toml::to_string_pretty(&config).context("Failed to serialize config")?
        );
        return Ok(());
    }

    let output_dir = config.output_directory();
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;
    info!(
        "Timelapses go to {:?}, one frame every {:?}",
        output_dir,
        config.capture_interval()
    );

    let orchestrator = Orchestrator::new(
        OrchestratorSettings::from(&config.timelapse),
        Box::new(StillCommandCamera::new(&config.camera)),
        Box::new(FfmpegEncoderFactory::new(&config.encoder, output_dir)),
        create_indicator_output(&config.indicator),
    );
    let (engine, handle) = create_session_engine(orchestrator, config.tick_interval());

    // Multi-threaded: the engine runs blocking driver calls in place
    let runtime = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Failed to start tokio runtime")?,
    );

    let engine_task = runtime.spawn(engine.run());

    runtime.block_on(start_event_sources(&config, &handle))?;

    install_shutdown_handler(runtime.clone(), handle)?;

    info!("Ready. Press Ctrl+C or send SIGTERM to exit...");

    let snapshot = runtime
        .block_on(engine_task)
        .context("Session engine panicked")?;
    if let Some(artifact) = &snapshot.last_artifact {
        info!("Last timelapse: {:?}", artifact);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Route SIGINT, SIGTERM and SIGHUP to an engine shutdown so an open
/// session is always finalized before the process exits
fn install_shutdown_handler(
    runtime: Arc<tokio::runtime::Runtime>,
    handle: SessionHandle,
) -> Result<()> {
    ctrlc::set_handler(move || {
        info!("Termination signal received, shutting down...");
        let handle = handle.clone();
        runtime.spawn(async move {
            if let Err(e) = handle.shutdown().await {
                error!("Shutdown failed: {:#}", e);
            }
        });
    })
    .context("Failed to install signal handler")
}

/// Start everything that feeds the engine
async fn start_event_sources(config: &Config, session: &SessionHandle) -> Result<()> {
    // a missing button leaves the printer and the operator in control
    match create_button_backend(&config.button) {
        Ok(Some(backend)) => {
            let debounce = Duration::from_millis(config.button.debounce_ms);
            if let Err(e) = spawn_button_source(backend, debounce, session.clone()) {
                warn!("Capture button unavailable: {:#}", e);
            }
        }
        Ok(None) => info!("No capture button configured"),
        Err(e) => warn!("Capture button unavailable: {:#}", e),
    }

    spawn_printer_poller(&config.printer, session.clone())?;
    spawn_command_channel(&config.remote, session.clone()).await?;
    let sensor = create_environment_sensor(&config.status);
    StatusReporter::new(&config.status, sensor)?.spawn(session.clone());

    Ok(())
}

fn print_help() {
    println!("printlapse - 3D-print timelapse rig agent");
    println!();
    println!("USAGE:");
    println!("    printlapse [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help            Print this help message");
    println!("    -c, --config <PATH>   Use this config file instead of the default");
    println!("        --print-config    Print the effective configuration and exit");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG              Set log level (e.g., debug, info, warn)");
    println!("    PRINTLAPSE_LOG_PATH   Directory for log files");
}
