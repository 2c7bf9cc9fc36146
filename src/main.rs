//! Database Backup Tool
//!
//! Streams database dumps of every configured service binding to object storage

use anyhow::{Context, Result};
use backman::backup;
use backman::config::AppConfig;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    match run_app().await {
        Ok(0) => {
            info!("All backups completed successfully.");
            ExitCode::SUCCESS
        }
        Ok(failures) => {
            error!("{} backup(s) failed.", failures);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backman=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_app() -> Result<usize> {
    let config_path = env::var("BACKMAN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let app_config = AppConfig::load_from_json(&config_path)
        .context(format!("Failed to load application configuration from {}", config_path.display()))?;

    // Optional service name: back up only that binding.
    let only = env::args().nth(1);
    if let Some(name) = &only {
        if !app_config.services.iter().any(|binding| &binding.name == name) {
            anyhow::bail!("No service named '{}' in {}", name, config_path.display());
        }
    }

    Ok(backup::run_backup_flow(&app_config, only.as_deref()).await)
}
