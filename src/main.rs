//! Main entry point for the revtun server binary.
//!
//! Loads configuration, sets up logging and runs the tunnel server until a
//! shutdown signal arrives.

use crate::config::AppConfig;
use crate::error::AppError;
use clap::Parser;
use log::info;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod error;

#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path, without extension (format auto-detected).
    #[clap(
        short,
        long,
        value_name = "CONFIG",
        env = "REVTUN_CONFIG",
        default_value = "config"
    )]
    config: String,

    /// Optional `.env` file path for loading environment variables.
    #[clap(short, long, value_name = "ENV_FILE")]
    env_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    if let Some(env_file) = cli.env_file {
        dotenvy::from_filename(env_file).expect("failed to load .env file");
    } else {
        dotenvy::dotenv().ok();
    }

    let app_config = AppConfig::parse_config(&cli.config)?;

    let env = EnvFilter::new(format!(
        "revtun_server={0},revtun_core={0},info",
        app_config.server.log_level
    ));
    let timer = tracing_subscriber::fmt::time::LocalTime::rfc_3339();
    tracing_subscriber::fmt()
        .with_timer(timer)
        .with_target(true)
        .with_env_filter(env)
        .init();

    let shutdown = CancellationToken::new();
    let shutdown_local = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown_local.cancel();
        }
    });

    revtun_server::server_init(app_config.server, shutdown).await?;
    Ok(())
}
