use log::{trace, warn};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Connect timeout used by the periodic prober for each check.
pub const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Edge-triggered liveness transition of a probed target.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HealthEvent {
    Down,
    Up,
}

/// One liveness check: can `addr` be connected to within `timeout`?
pub async fn probe_tcp(addr: &str, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        _ => false,
    }
}

/// Probe `target` every `interval` until cancelled, sending a [`HealthEvent`]
/// only when the observed state flips.
///
/// The baseline is alive: if the very first check fails, `Down` is sent;
/// repeated observations of the same state send nothing.
pub async fn periodic_probe(
    target: String,
    interval: Duration,
    events: mpsc::Sender<HealthEvent>,
    cancel: CancellationToken,
) {
    let mut alive = true;
    loop {
        let ok = probe_tcp(&target, PROBE_CONNECT_TIMEOUT).await;
        if ok {
            trace!("Health probe: {target} is reachable");
            if !alive && events.send(HealthEvent::Up).await.is_err() {
                return;
            }
        } else {
            warn!("Health probe: {target} is unreachable");
            if alive && events.send(HealthEvent::Down).await.is_err() {
                return;
            }
        }
        alive = ok;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_tcp_reports_listener_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(probe_tcp(&addr, Duration::from_secs(1)).await);
        drop(listener);
        assert!(!probe_tcp(&addr, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn events_fire_only_on_transitions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let prober = tokio::spawn(periodic_probe(
            addr.to_string(),
            Duration::from_millis(20),
            tx,
            cancel.clone(),
        ));

        // Alive from the start: several checks pass without any event.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        // Going down fires exactly one Down.
        drop(listener);
        assert_eq!(rx.recv().await, Some(HealthEvent::Down));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        // Coming back fires exactly one Up.
        let listener = TcpListener::bind(addr).await.unwrap();
        assert_eq!(rx.recv().await, Some(HealthEvent::Up));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        drop(listener);

        cancel.cancel();
        prober.await.unwrap();
    }

    #[tokio::test]
    async fn dead_at_first_check_fires_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let prober = tokio::spawn(periodic_probe(
            addr,
            Duration::from_millis(20),
            tx,
            cancel.clone(),
        ));
        assert_eq!(rx.recv().await, Some(HealthEvent::Down));
        cancel.cancel();
        prober.await.unwrap();
    }
}
