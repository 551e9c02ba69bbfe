//! The authoritative table of active port mappings.
//!
//! One mapping binds a public port to a client control session and carries
//! the rendezvous queue through which accepted user connections are paired
//! with client-dialed data channels. All mutations go through this module;
//! the lock is held for table surgery only, never across network I/O.

use log::{debug, info, trace, warn};
use revtun_core::connection::{ControlHandle, DataStream};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Capacity of the per-mapping queue of pending data channels. Deliberately
/// small: a client that dials faster than users are paired gets its surplus
/// connections dropped instead of growing server memory.
pub const DATA_CHANNEL_QUEUE_CAPACITY: usize = 10;

/// Shared receiving end of a mapping's rendezvous queue. Each per-accept
/// dispatch task takes the lock for the duration of one rendezvous.
pub type DataChannelQueue = Arc<Mutex<mpsc::Receiver<DataStream>>>;

pub struct PortMapping {
    pub control: ControlHandle,
    pub local_port: u16,
    pub last_heartbeat: Instant,
    data_tx: mpsc::Sender<DataStream>,
    data_rx: DataChannelQueue,
    pub listen_stop: CancellationToken,
}

impl PortMapping {
    fn new(local_port: u16, control: ControlHandle) -> (Self, CancellationToken) {
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_QUEUE_CAPACITY);
        let listen_stop = CancellationToken::new();
        (
            Self {
                control,
                local_port,
                last_heartbeat: Instant::now(),
                data_tx,
                data_rx: Arc::new(Mutex::new(data_rx)),
                listen_stop: listen_stop.clone(),
            },
            listen_stop,
        )
    }

    /// Stop the public listener, close the control connection and drop the
    /// rendezvous queue; undequeued data streams close with it.
    fn close(self) {
        self.listen_stop.cancel();
        self.control.close();
    }
}

pub type SharedRegistry = Arc<MappingRegistry>;

#[derive(Default)]
pub struct MappingRegistry {
    mappings: RwLock<HashMap<u16, PortMapping>>,
}

impl MappingRegistry {
    pub fn new() -> SharedRegistry {
        Arc::new(Self::default())
    }

    /// Install a mapping for `remote_port`, displacing any previous owner.
    ///
    /// The displaced mapping is fully torn down: its listener stops, its
    /// control connection closes and its queued data streams are dropped.
    /// Returns the stop token owning the new mapping's public listener.
    pub async fn register(
        &self,
        remote_port: u16,
        local_port: u16,
        control: ControlHandle,
    ) -> CancellationToken {
        let (mapping, listen_stop) = PortMapping::new(local_port, control);
        let displaced = self.mappings.write().await.insert(remote_port, mapping);
        if let Some(old) = displaced {
            warn!("Port {remote_port} re-registered, displacing the previous mapping");
            old.close();
        }
        listen_stop
    }

    /// Record client liveness. No-op when the mapping is gone.
    pub async fn refresh_heartbeat(&self, remote_port: u16) {
        if let Some(mapping) = self.mappings.write().await.get_mut(&remote_port) {
            mapping.last_heartbeat = Instant::now();
        }
    }

    /// Hand a fresh data channel to the mapping's rendezvous queue without
    /// blocking. On overflow or a missing mapping the stream is dropped,
    /// which closes it.
    pub async fn enqueue_data_channel(&self, remote_port: u16, data: DataStream) {
        let tx = {
            self.mappings
                .read()
                .await
                .get(&remote_port)
                .map(|m| m.data_tx.clone())
        };
        let Some(tx) = tx else {
            warn!("Data channel for unmapped port {remote_port}, closing it");
            return;
        };
        match tx.try_send(data) {
            Ok(()) => debug!("Data channel queued for port {remote_port}"),
            Err(TrySendError::Full(_)) => {
                warn!("Pending data channel queue for port {remote_port} is full, dropping the connection");
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Data channel arrived while port {remote_port} was shutting down");
            }
        }
    }

    /// The queue a dispatch task should rendezvous on, if the mapping still
    /// exists.
    pub async fn data_channel_queue(&self, remote_port: u16) -> Option<DataChannelQueue> {
        self.mappings
            .read()
            .await
            .get(&remote_port)
            .map(|m| m.data_rx.clone())
    }

    /// Stop the public listener and forget the mapping. The control
    /// connection stays open so the client can rejoin with `online_port`.
    pub async fn take_offline(&self, remote_port: u16) {
        if let Some(mapping) = self.mappings.write().await.remove(&remote_port) {
            mapping.listen_stop.cancel();
            info!("Port {remote_port} taken offline");
        }
    }

    /// Attach a fresh listener stop token for `remote_port`, replacing (and
    /// cancelling) a live one. A mapping removed by [`take_offline`] is
    /// reinstalled from the session's registered state, so the restarted
    /// listener can rendezvous again.
    ///
    /// [`take_offline`]: MappingRegistry::take_offline
    pub async fn set_online(
        &self,
        remote_port: u16,
        local_port: u16,
        control: ControlHandle,
    ) -> CancellationToken {
        let mut mappings = self.mappings.write().await;
        match mappings.get_mut(&remote_port) {
            Some(mapping) => {
                mapping.listen_stop.cancel();
                let fresh = CancellationToken::new();
                mapping.listen_stop = fresh.clone();
                fresh
            }
            None => {
                let (mapping, fresh) = PortMapping::new(local_port, control);
                mappings.insert(remote_port, mapping);
                fresh
            }
        }
    }

    /// Tear down the mapping for `remote_port`, but only while it still
    /// belongs to `control`'s session. The normal end of a control session.
    ///
    /// The identity check keeps a displaced session's teardown from ripping
    /// out the mapping its successor just installed under the same port.
    pub async fn remove_session(&self, remote_port: u16, control: &ControlHandle) {
        let mapping = {
            let mut mappings = self.mappings.write().await;
            match mappings.get(&remote_port) {
                Some(m) if m.control.same_connection(control) => mappings.remove(&remote_port),
                _ => None,
            }
        };
        if let Some(mapping) = mapping {
            mapping.close();
        }
    }

    /// Reap every mapping whose heartbeat is older than `timeout`. Only the
    /// control connection is closed here; its session handler observes the
    /// close and stops the public listener on its way out.
    pub async fn sweep(&self, timeout: Duration) {
        let now = Instant::now();
        let expired: Vec<(u16, PortMapping)> = {
            let mut mappings = self.mappings.write().await;
            let stale: Vec<u16> = mappings
                .iter()
                .filter(|(_, m)| now.duration_since(m.last_heartbeat) > timeout)
                .map(|(port, _)| *port)
                .collect();
            stale
                .into_iter()
                .filter_map(|port| mappings.remove(&port).map(|m| (port, m)))
                .collect()
        };
        for (port, mapping) in expired {
            warn!("Client for port {port} missed its heartbeat window, closing");
            mapping.control.close();
        }
    }

    /// Close every mapping and empty the table.
    pub async fn shutdown(&self) {
        let all: Vec<(u16, PortMapping)> = {
            let mut mappings = self.mappings.write().await;
            mappings.drain().collect()
        };
        for (port, mapping) in all {
            info!("Closing mapping for port {port}");
            mapping.close();
        }
    }

    pub async fn contains(&self, remote_port: u16) -> bool {
        self.mappings.read().await.contains_key(&remote_port)
    }

    pub async fn len(&self) -> usize {
        self.mappings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.mappings.read().await.is_empty()
    }
}

/// Periodic reaper of mappings whose client stopped pinging.
pub async fn watchdog(
    registry: SharedRegistry,
    sweep_interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                trace!("Sweeping for dead clients");
                registry.sweep(timeout).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revtun_core::connection::TcpConnection;
    use tokio::net::{TcpListener, TcpStream};

    async fn control_handle() -> ControlHandle {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        let (_receiver, handle) = TcpConnection::from_stream(client).into_split(8);
        handle
    }

    async fn data_stream() -> DataStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        TcpConnection::from_stream(client).into_data_stream()
    }

    #[tokio::test]
    async fn re_registration_displaces_the_previous_mapping() {
        let registry = MappingRegistry::new();
        let first = control_handle().await;
        let second = control_handle().await;

        let first_stop = registry.register(10022, 22, first.clone()).await;
        registry.register(10022, 8080, second.clone()).await;

        assert_eq!(registry.len().await, 1);
        assert!(first.is_closed());
        assert!(first_stop.is_cancelled());
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn displaced_session_teardown_spares_the_new_mapping() {
        let registry = MappingRegistry::new();
        let first = control_handle().await;
        let second = control_handle().await;

        registry.register(10022, 22, first.clone()).await;
        registry.register(10022, 22, second.clone()).await;

        // The displaced session cleaning up after itself must not take the
        // successor's mapping with it.
        registry.remove_session(10022, &first).await;
        assert!(registry.contains(10022).await);
        assert!(!second.is_closed());

        registry.remove_session(10022, &second).await;
        assert!(!registry.contains(10022).await);
        assert!(second.is_closed());
    }

    #[tokio::test]
    async fn queue_overflow_drops_the_excess_channel() {
        let registry = MappingRegistry::new();
        let handle = control_handle().await;
        registry.register(10022, 22, handle).await;

        for _ in 0..DATA_CHANNEL_QUEUE_CAPACITY + 1 {
            registry.enqueue_data_channel(10022, data_stream().await).await;
        }

        // Exactly the capacity survived; the overflow connection was dropped.
        let queue = registry.data_channel_queue(10022).await.unwrap();
        let mut queue = queue.lock().await;
        for _ in 0..DATA_CHANNEL_QUEUE_CAPACITY {
            assert!(queue.try_recv().is_ok());
        }
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_then_online_keeps_the_control_connection() {
        let registry = MappingRegistry::new();
        let handle = control_handle().await;
        let stop = registry.register(10022, 22, handle.clone()).await;

        registry.take_offline(10022).await;
        assert!(stop.is_cancelled());
        assert!(!registry.contains(10022).await);
        assert!(!handle.is_closed());

        let fresh = registry.set_online(10022, 22, handle.clone()).await;
        assert!(!fresh.is_cancelled());
        assert!(registry.contains(10022).await);
    }

    #[tokio::test]
    async fn set_online_on_a_live_mapping_swaps_the_stop_token() {
        let registry = MappingRegistry::new();
        let handle = control_handle().await;
        let stop = registry.register(10022, 22, handle.clone()).await;

        let fresh = registry.set_online(10022, 22, handle).await;
        assert!(stop.is_cancelled());
        assert!(!fresh.is_cancelled());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn sweep_reaps_only_stale_mappings() {
        let registry = MappingRegistry::new();
        let stale = control_handle().await;
        let fresh = control_handle().await;
        registry.register(10022, 22, stale.clone()).await;
        registry.register(10023, 23, fresh.clone()).await;

        // Let both age past the timeout, then refresh only one.
        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.refresh_heartbeat(10023).await;

        registry.sweep(Duration::from_millis(40)).await;
        assert!(!registry.contains(10022).await);
        assert!(registry.contains(10023).await);
        assert!(stale.is_closed());
        assert!(!fresh.is_closed());
    }

    #[tokio::test]
    async fn refresh_heartbeat_defers_the_reaper() {
        let registry = MappingRegistry::new();
        let handle = control_handle().await;
        registry.register(10022, 22, handle).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        registry.refresh_heartbeat(10022).await;
        registry.sweep(Duration::from_millis(40)).await;
        assert!(registry.contains(10022).await);
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_empties_the_table() {
        let registry = MappingRegistry::new();
        let first = control_handle().await;
        let second = control_handle().await;
        let first_stop = registry.register(10022, 22, first.clone()).await;
        let second_stop = registry.register(10023, 23, second.clone()).await;

        registry.shutdown().await;
        assert!(registry.is_empty().await);
        assert!(first.is_closed());
        assert!(second.is_closed());
        assert!(first_stop.is_cancelled());
        assert!(second_stop.is_cancelled());
    }
}
