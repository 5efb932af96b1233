//! `remote-agent` binary.
//!
//! Configuration comes from `AGENT_*` environment variables; log filtering
//! from `RUST_LOG` (default `remote_agent=info`).

use std::process::ExitCode;
use std::sync::Arc;

use remote_agent::{Agent, AgentConfig, ProcessExecutor};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Functions
// ============================================================================

/// Initialize tracing/logging.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("remote_agent=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = AgentConfig::from_env();
    if config.allowed_commands.is_empty() {
        warn!("AGENT_ALLOWED_COMMANDS is empty; every command will be refused");
    }
    let executor = Arc::new(ProcessExecutor::new(config.allowed_commands.clone()));

    let agent = match Agent::start(config, executor).await {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "Agent failed to start");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }

    info!("Shutting down");
    agent.shutdown().await;
    ExitCode::SUCCESS
}
