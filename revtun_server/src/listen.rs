//! Control-port accept loop.

use crate::config::ServerConfig;
use crate::connection::ConnectionManager;
use crate::error::ServerError;
use crate::registry::SharedRegistry;
use log::{error, info};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Accept control connections until `shutdown` is cancelled, spawning one
/// session handler per connection.
pub async fn listen(
    registry: SharedRegistry,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(&config.addr).await?;
    info!("Control channel listening on {}", listener.local_addr()?);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("Connection from {addr}");
                    let manager = ConnectionManager::new(registry.clone(), config.clone());
                    tokio::spawn(async move {
                        if let Err(e) = manager.handle(stream).await {
                            error!("Connection from {addr} failed: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("Accept failed on the control port: {e}");
                }
            }
        }
    }
}
