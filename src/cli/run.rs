use crate::agent::{AgentError, AgentRunner, RunMode, StopReason};
use crate::config::parse::load_config;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("frame source failed: {0}")]
    SourceFailed(String),
}

pub async fn run(config_path: Option<PathBuf>, mode: RunMode) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/edge-agent/config.yml");
            eprintln!("  /etc/edge-agent/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'edge-agent config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_agent(&config_path, mode).await.map_err(|e| e.into())
}

async fn run_agent(config_path: &PathBuf, mode: RunMode) -> Result<(), RunError> {
    let config = load_config(config_path)?;
    let _log_guard = crate::logging::init(config.logging.dir.as_deref());
    info!(config_path = %config_path.display(), mode = mode.as_str(), "Configuration loaded");

    let summary = AgentRunner::new(config, mode).run().await?;
    match summary.capture.stop {
        StopReason::SourceFailed(reason) => {
            error!(reason = %reason, "Capture ended on a source failure");
            Err(RunError::SourceFailed(reason))
        }
        StopReason::Shutdown | StopReason::EndOfStream => Ok(()),
    }
}
