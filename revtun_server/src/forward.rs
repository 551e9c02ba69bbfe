//! Public-port listener: accepts user connections for one mapping and pairs
//! each with a client-dialed data channel.

use crate::registry::SharedRegistry;
use log::{debug, error, info, warn};
use revtun_core::app_packet::ControlPacket;
use revtun_core::connection::ControlHandle;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Accept loop for `:{remote_port}`, owned by its `stop` token.
///
/// A bind failure is logged and the task ends; the mapping stays registered
/// so the client can retry with a later `online_port`. Accept errors are
/// logged and accepting continues until `stop` is cancelled.
pub async fn listen_and_forward(
    remote_port: u16,
    local_port: u16,
    control: ControlHandle,
    stop: CancellationToken,
    registry: SharedRegistry,
    rendezvous_timeout: Duration,
) {
    let listener = match TcpListener::bind(("0.0.0.0", remote_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind public port {remote_port}: {e}");
            return;
        }
    };
    info!("Public port {remote_port} listening");
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                info!("Public port {remote_port} stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((user, peer)) => {
                    debug!("User connection from {peer} on public port {remote_port}");
                    tokio::spawn(dispatch_user_connection(
                        user,
                        remote_port,
                        control.clone(),
                        local_port,
                        registry.clone(),
                        rendezvous_timeout,
                    ));
                }
                Err(e) => {
                    error!("Accept failed on public port {remote_port}: {e}");
                }
            }
        }
    }
}

/// Pair one accepted user connection with a data channel, then relay.
///
/// Every failure path simply drops the user stream, which the external
/// client observes as EOF; the mapping itself is untouched.
async fn dispatch_user_connection(
    user: TcpStream,
    remote_port: u16,
    control: ControlHandle,
    local_port: u16,
    registry: SharedRegistry,
    rendezvous_timeout: Duration,
) {
    if let Err(e) = control
        .send(ControlPacket::OpenDataChannel { local_port })
        .await
    {
        error!("Failed to request a data channel for port {remote_port}: {e}");
        return;
    }
    // The mapping may have been torn down since this connection was accepted.
    let Some(queue) = registry.data_channel_queue(remote_port).await else {
        warn!("Mapping for port {remote_port} is gone, dropping the user connection");
        return;
    };
    let rendezvous = async { queue.lock().await.recv().await };
    match tokio::time::timeout(rendezvous_timeout, rendezvous).await {
        Ok(Some(data)) => {
            debug!("Relay starting on port {remote_port}");
            data.relay_with(user).await;
            debug!("Relay finished on port {remote_port}");
        }
        Ok(None) => {
            warn!("Data channel queue for port {remote_port} closed, dropping the user connection");
        }
        Err(_) => {
            warn!(
                "No data channel for port {remote_port} within {:?}, dropping the user connection",
                rendezvous_timeout
            );
        }
    }
}
