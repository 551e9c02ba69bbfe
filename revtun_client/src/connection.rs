//! Client side of the tunnel: registration, the control session with its
//! heartbeat and health-probe tasks, and per-request data channels.

use crate::config::ClientConfig;
use crate::error::ClientError;
use log::{debug, error, info, trace, warn};
use revtun_core::app_packet::{ControlPacket, RegisterStatus};
use revtun_core::connection::TcpConnection;
use revtun_core::error::CoreError;
use revtun_core::health::{HealthEvent, periodic_probe};
use revtun_core::heartbeat::run_heartbeat;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Dial timeout towards the server, for both control and data connections.
const SERVER_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Packets queued towards the control connection's writer task.
const CONTROL_QUEUE_CAPACITY: usize = 64;

/// Drives one control connection through its whole life: register, serve
/// data-channel requests, signal local health transitions, reconnect is the
/// caller's job.
pub struct ConnectionManager {
    config: Arc<ClientConfig>,
}

impl ConnectionManager {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    /// Dial the server and claim the configured mapping. A `fail` response
    /// surfaces the server's reason; the outer loop decides whether to retry.
    pub async fn connect_and_register(&self) -> Result<TcpConnection, ClientError> {
        let config = &self.config;
        let mut conn =
            TcpConnection::connect(&config.server_addr, SERVER_CONNECT_TIMEOUT).await?;
        conn.send_packet(&ControlPacket::Register {
            local_port: config.local_port(),
            remote_port: config.remote_port,
            protocol: "tcp".to_owned(),
            token: config.token.clone(),
            name: config.name.clone(),
        })
        .await?;
        match conn.receive_packet().await? {
            Some(ControlPacket::RegisterResp {
                status: RegisterStatus::Ok,
                ..
            }) => Ok(conn),
            Some(ControlPacket::RegisterResp { reason, .. }) => Err(
                ClientError::RegistrationRejected(
                    reason.unwrap_or_else(|| "no reason given".to_owned()),
                ),
            ),
            Some(other) => Err(ClientError::Protocol(format!(
                "unexpected reply to registration: {other:?}"
            ))),
            None => Err(ClientError::Protocol(
                "connection closed during registration".to_owned(),
            )),
        }
    }

    /// Run the session loop on an established control connection until it
    /// disconnects or a session task fails.
    pub async fn run_session(&self, conn: TcpConnection) -> Result<(), ClientError> {
        let config = &self.config;
        let (mut receiver, handle) = conn.into_split(CONTROL_QUEUE_CAPACITY);
        let cancel = handle.cancel_token();

        let (health_tx, mut health_rx) = mpsc::channel(8);
        let mut join_set: JoinSet<Result<(), CoreError>> = JoinSet::new();
        join_set.spawn(run_heartbeat(
            handle.clone(),
            config.heartbeat_interval,
            cancel.clone(),
        ));
        let probe_target = format!("127.0.0.1:{}", config.local_port());
        let probe_interval = config.health_check_interval;
        let cancel_local = cancel.clone();
        join_set.spawn(async move {
            periodic_probe(probe_target, probe_interval, health_tx, cancel_local).await;
            Ok(())
        });

        let mut health_down = false;
        let result = loop {
            tokio::select! {
                packet = receiver.receive() => match packet {
                    Ok(Some(ControlPacket::Pong { .. })) => {
                        trace!("Heartbeat pong received");
                    }
                    Ok(Some(ControlPacket::OpenDataChannel { local_port })) => {
                        info!("Server requested a data channel for local port {local_port}");
                        // Served in its own task so a slow dial cannot stall
                        // the control loop.
                        let config = self.config.clone();
                        tokio::spawn(open_data_channel(config, local_port));
                    }
                    Ok(Some(other)) => {
                        debug!("Ignoring control packet: {other:?}");
                    }
                    Ok(None) => break Err(ClientError::Disconnected),
                    Err(e) => break Err(e.into()),
                },
                Some(event) = health_rx.recv() => match event {
                    HealthEvent::Down if !health_down => {
                        warn!(
                            "Local port {} is unreachable, taking :{} offline",
                            config.local_port(),
                            config.remote_port
                        );
                        if let Err(e) = handle
                            .send(ControlPacket::OfflinePort { port: config.remote_port })
                            .await
                        {
                            error!("Failed to send the offline notice: {e}");
                        }
                        health_down = true;
                    }
                    HealthEvent::Up if health_down => {
                        info!(
                            "Local port {} recovered, bringing :{} back online",
                            config.local_port(),
                            config.remote_port
                        );
                        if let Err(e) = handle
                            .send(ControlPacket::OnlinePort { port: config.remote_port })
                            .await
                        {
                            error!("Failed to send the online notice: {e}");
                        }
                        health_down = false;
                    }
                    _ => {}
                },
                Some(finished) = join_set.join_next() => match finished {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e.into()),
                    Err(e) => break Err(ClientError::Task(e.to_string())),
                },
            }
        };

        handle.close();
        join_set.shutdown().await;
        result
    }
}

/// Serve one `open_data_channel` request end to end.
async fn open_data_channel(config: Arc<ClientConfig>, local_port: u16) {
    if let Err(e) = run_data_channel(&config, local_port).await {
        error!("Data channel for local port {local_port} failed: {e}");
    }
}

async fn run_data_channel(config: &ClientConfig, local_port: u16) -> Result<(), ClientError> {
    let mut conn = TcpConnection::connect(&config.server_addr, SERVER_CONNECT_TIMEOUT).await?;
    conn.send_packet(&ControlPacket::DataChannel {
        local_port,
        remote_port: config.remote_port,
        token: config.token.clone(),
        name: config.name.clone(),
    })
    .await?;
    match conn.receive_packet().await? {
        Some(ControlPacket::RegisterResp {
            status: RegisterStatus::Ok,
            ..
        }) => {}
        Some(ControlPacket::RegisterResp { reason, .. }) => {
            return Err(ClientError::RegistrationRejected(
                reason.unwrap_or_else(|| "no reason given".to_owned()),
            ));
        }
        _ => {
            return Err(ClientError::Protocol(
                "unexpected reply to data channel registration".to_owned(),
            ));
        }
    }

    let local_addr = format!("127.0.0.1:{local_port}");
    let local = TcpStream::connect(&local_addr).await?;
    debug!("Relaying local port {local_port}");
    conn.into_data_stream().relay_with(local).await;
    debug!("Relay for local port {local_port} finished");
    Ok(())
}
