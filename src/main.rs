//! Port-reuse TCP listener fleet
//!
//! Loads config.toml, starts one echo worker per endpoint on the configured
//! port, and runs until Ctrl-C. Exits non-zero if startup fails.

use fleetd::infrastructure::logging::init_logging;
use fleetd::{Config, EchoHandler, Result, Supervisor};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Load config or fail before anything is bound
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fleetd: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _guards = match init_logging(&config.logging) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("fleetd: failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fleetd exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let mut supervisor = Supervisor::new(&config, EchoHandler);
    supervisor.start().await?;

    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");

    // Always tear down, even if the signal handler itself failed
    supervisor.stop().await;

    signal?;
    Ok(())
}
