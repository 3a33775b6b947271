//! Virtual ECU simulator binary.
//!
//! Runs the lifecycle loop (BOOT → APPLICATION / UPDATE_PENDING →
//! BRICKED) on the main task and the DoIP acceptor alongside it. The
//! cruise-control application is loaded from a shared library each
//! APPLICATION cycle, so a completed OTA takes effect on the next
//! cycle.
//!
//! # Usage
//!
//! ```bash
//! ./vecu                      # defaults: port 13400, ./nvram.dat
//! ./vecu --config vecu.toml   # or configure via TOML
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};
use vecu_core::state::EcuState;

use vecu_ecu::config::EcuConfig;
use vecu_ecu::ecu::VirtualEcu;
use vecu_ecu::server::DoipServer;

#[derive(Parser, Debug)]
#[command(name = "vecu")]
#[command(about = "Virtual ECU simulator with a DoIP/UDS diagnostic server")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<String>,

    /// DoIP TCP port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// NVRAM backing file (overrides the config file)
    #[arg(long)]
    nvram_file: Option<PathBuf>,

    /// Application module path (overrides the config file)
    #[arg(long)]
    app_module: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "vecu_ecu=debug,vecu_core=debug"
    } else {
        "vecu_ecu=info,vecu_core=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => {
            info!(path = %path, "loading configuration");
            EcuConfig::load(path)
                .map_err(|e| anyhow::anyhow!("failed to load config {path}: {e}"))?
        }
        None => EcuConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(nvram_file) = args.nvram_file {
        config.nvram_file = nvram_file;
    }
    if let Some(app_module) = args.app_module {
        config.app_module = app_module;
    }

    info!(
        port = config.port,
        nvram = %config.nvram_file.display(),
        module = %config.app_module.display(),
        "virtual ECU simulation starting"
    );

    let ecu = Arc::new(VirtualEcu::new(config));

    let server = match DoipServer::bind(("0.0.0.0", ecu.config().port), ecu.clone()).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start network server, entering BRICKED state");
            ecu.state().store(EcuState::Bricked);
            bail!("failed to bind DoIP port {}: {e}", ecu.config().port);
        }
    };
    let acceptor = tokio::spawn(server.run());

    info!("press Ctrl+C to shut down");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for shutdown signal")?;
            info!("shutdown signal received");
        }
        _ = run_lifecycle(ecu.clone()) => {}
    }

    acceptor.abort();
    let _ = acceptor.await;
    ecu.shutdown();

    if ecu.state().load() == EcuState::Bricked {
        bail!("ECU is BRICKED, halting operations");
    }

    info!("virtual ECU simulation shutting down");
    Ok(())
}

/// The lifecycle loop. Returns only when the ECU bricks.
async fn run_lifecycle(ecu: Arc<VirtualEcu>) {
    let cycle = Duration::from_secs(ecu.config().cycle_seconds);
    loop {
        match ecu.state().load() {
            EcuState::Boot => ecu.boot(),
            EcuState::Application => {
                ecu.run_application_cycle();
                tokio::time::sleep(cycle).await;
            }
            EcuState::UpdatePending => {
                info!("in UPDATE_PENDING, waiting for tester commands");
                tokio::time::sleep(cycle).await;
            }
            EcuState::Bricked => {
                error!("ECU is BRICKED, halting operations");
                return;
            }
        }
    }
}
