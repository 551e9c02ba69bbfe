//! Main entry point for the revtun client binary.
//!
//! Keeps one control connection registered against the server and restarts
//! it after failures: dial, register, run the session, pause, repeat. The
//! session itself serves data-channel requests and reports local-service
//! health; a shutdown signal ends the loop.

use clap::Parser;
use log::{error, info, warn};
use revtun_client::config::AppConfig;
use revtun_client::connection::ConnectionManager;
use revtun_client::error::ClientError;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

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
async fn main() -> Result<(), ClientError> {
    let cli = Cli::parse();
    if let Some(env_file) = cli.env_file {
        dotenvy::from_filename(env_file).expect("failed to load .env file");
    } else {
        dotenvy::dotenv().ok();
    }

    let config = Arc::new(AppConfig::parse_config(&cli.config)?.client);

    let env = EnvFilter::new(format!(
        "revtun_client={0},revtun_core={0},info",
        config.log_level
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

    info!(
        "Mapping local port {} to public port {} on {}",
        config.local_port(),
        config.remote_port,
        config.server_addr
    );
    let manager = ConnectionManager::new(config.clone());

    while !shutdown.is_cancelled() {
        let registered = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = manager.connect_and_register() => result,
        };
        match registered {
            Ok(conn) => {
                info!("Port registration succeeded");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = manager.run_session(conn) => {
                        if let Err(e) = result {
                            warn!("Control session ended: {e}");
                        }
                    }
                }
            }
            Err(e) => {
                error!("{e}");
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.retry_interval) => {}
        }
    }

    info!("Shutdown complete");
    Ok(())
}
