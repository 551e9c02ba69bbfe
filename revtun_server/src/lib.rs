//! revtun_server crate entry points and task management.
//!
//! Wires together the control-port accept loop, the mapping registry and the
//! heartbeat watchdog, and runs the graceful-shutdown sequence when the
//! shutdown token fires.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry::{MappingRegistry, watchdog};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod connection;
pub mod error;
pub mod forward;
pub mod listen;
pub mod registry;

/// Pause after closing all mappings so in-flight relays can drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Run the tunnel server until `shutdown` is cancelled.
///
/// Spawns the heartbeat watchdog, then serves the control port. On shutdown
/// the accept loop stops first, then every registered mapping is closed and
/// a short grace period lets relays finish.
pub async fn server_init(
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let config = Arc::new(config);
    let registry = MappingRegistry::new();

    info!("Starting the heartbeat watchdog");
    let watchdog_task = tokio::spawn(watchdog(
        registry.clone(),
        config.sweep_interval,
        config.heartbeat_timeout,
        shutdown.clone(),
    ));

    let result = listen::listen(registry.clone(), config, shutdown.clone()).await;

    info!("Shutdown started");
    // The accept loop may have ended on its own (e.g. a bind failure); make
    // sure the watchdog winds down too.
    shutdown.cancel();
    registry.shutdown().await;
    let _ = watchdog_task.await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    info!("Shutdown complete");
    result
}
