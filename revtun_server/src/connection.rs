//! Server side of a control connection: authentication, registration or
//! data-channel admission, then the per-session packet loop.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::forward::listen_and_forward;
use crate::registry::SharedRegistry;
use log::{error, info, warn};
use revtun_core::app_packet::{ControlPacket, unix_now};
use revtun_core::connection::{ControlHandle, ControlReceiver, TcpConnection};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Packets queued towards one control connection's writer task.
const CONTROL_QUEUE_CAPACITY: usize = 64;

/// Handles a single accepted control-port connection.
///
/// The first packet decides what the connection is:
/// - `register` claims a public port; the connection becomes a long-lived
///   control session (heartbeats, offline/online, data-channel requests).
/// - `data_channel` turns the connection into a relay stream for an
///   existing mapping; the handler enqueues it and returns without closing.
/// - anything else is a protocol error.
pub struct ConnectionManager {
    registry: SharedRegistry,
    config: Arc<ServerConfig>,
}

impl ConnectionManager {
    pub fn new(registry: SharedRegistry, config: Arc<ServerConfig>) -> Self {
        Self { registry, config }
    }

    pub async fn handle(self, stream: TcpStream) -> Result<(), ServerError> {
        let mut conn = TcpConnection::from_stream(stream);
        let first = tokio::time::timeout(self.config.initial_timeout, conn.receive_packet())
            .await
            .map_err(|_| {
                ServerError::InvalidRegistration(
                    "timed out waiting for the registration packet".to_owned(),
                )
            })??;
        match first {
            Some(ControlPacket::Register {
                local_port,
                remote_port,
                protocol,
                token,
                name,
            }) => {
                self.handle_register(conn, local_port, remote_port, protocol, token, name)
                    .await
            }
            Some(ControlPacket::DataChannel {
                remote_port,
                token,
                name,
                ..
            }) => {
                self.handle_data_channel(conn, remote_port, token, name)
                    .await
            }
            Some(other) => Err(ServerError::InvalidRegistration(format!(
                "unexpected first packet: {other:?}"
            ))),
            None => Err(ServerError::InvalidRegistration(
                "connection closed before registering".to_owned(),
            )),
        }
    }

    fn token_matches(&self, presented: &str) -> bool {
        presented
            .as_bytes()
            .ct_eq(self.config.token.as_bytes())
            .into()
    }

    async fn handle_data_channel(
        self,
        mut conn: TcpConnection,
        remote_port: u16,
        token: String,
        name: String,
    ) -> Result<(), ServerError> {
        if !self.token_matches(&token) {
            warn!("Token authentication failed for data channel from {name}");
            let _ = conn
                .send_packet(&ControlPacket::register_fail("authentication failed"))
                .await;
            return Ok(());
        }
        conn.send_packet(&ControlPacket::register_ok()).await?;
        info!("Data channel established for port {remote_port}");
        // Ownership passes to whichever dispatch task dequeues the stream;
        // this handler must not close it.
        self.registry
            .enqueue_data_channel(remote_port, conn.into_data_stream())
            .await;
        Ok(())
    }

    async fn handle_register(
        self,
        conn: TcpConnection,
        local_port: u16,
        remote_port: u16,
        protocol: String,
        token: String,
        name: String,
    ) -> Result<(), ServerError> {
        if !self.token_matches(&token) {
            warn!("Token authentication failed for client {name}");
            let mut conn = conn;
            let _ = conn
                .send_packet(&ControlPacket::register_fail("authentication failed"))
                .await;
            return Ok(());
        }

        let (receiver, handle) = conn.into_split(CONTROL_QUEUE_CAPACITY);
        let listen_stop = self
            .registry
            .register(remote_port, local_port, handle.clone())
            .await;
        info!("Registered mapping {local_port} -> :{remote_port} for {name} ({protocol})");

        if let Err(e) = handle.send(ControlPacket::register_ok()).await {
            error!("Failed to confirm registration for port {remote_port}: {e}");
            self.registry.remove_session(remote_port, &handle).await;
            return Err(e.into());
        }

        tokio::spawn(listen_and_forward(
            remote_port,
            local_port,
            handle.clone(),
            listen_stop.clone(),
            self.registry.clone(),
            self.config.rendezvous_timeout,
        ));

        self.session_loop(receiver, handle.clone(), remote_port, local_port, listen_stop)
            .await;

        self.registry.remove_session(remote_port, &handle).await;
        info!("Control session for port {remote_port} ended");
        Ok(())
    }

    /// Packet loop of an established control session. Returns when the
    /// client disconnects or the connection is force-closed; the caller
    /// removes the mapping.
    async fn session_loop(
        &self,
        mut receiver: ControlReceiver,
        handle: ControlHandle,
        remote_port: u16,
        local_port: u16,
        mut listen_stop: CancellationToken,
    ) {
        loop {
            match receiver.receive().await {
                Ok(Some(ControlPacket::Ping { .. })) => {
                    self.registry.refresh_heartbeat(remote_port).await;
                    if let Err(e) = handle.send(ControlPacket::Pong { time: unix_now() }).await {
                        error!("Failed to answer heartbeat for port {remote_port}: {e}");
                        listen_stop.cancel();
                        return;
                    }
                }
                Ok(Some(ControlPacket::OfflinePort { port })) => {
                    info!("Client took port {port} offline");
                    self.registry.take_offline(port).await;
                }
                Ok(Some(ControlPacket::OnlinePort { port })) => {
                    info!("Client brought port {port} back online");
                    let fresh = self
                        .registry
                        .set_online(port, local_port, handle.clone())
                        .await;
                    listen_stop = fresh.clone();
                    tokio::spawn(listen_and_forward(
                        port,
                        local_port,
                        handle.clone(),
                        fresh,
                        self.registry.clone(),
                        self.config.rendezvous_timeout,
                    ));
                }
                // Only ever sent server -> client; a client echoing it back
                // carries no meaning.
                Ok(Some(ControlPacket::OpenDataChannel { .. })) => {}
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!("Control channel for port {remote_port} disconnected");
                    listen_stop.cancel();
                    return;
                }
                Err(e) => {
                    warn!("Control channel read failed for port {remote_port}: {e}");
                    listen_stop.cancel();
                    return;
                }
            }
        }
    }
}
