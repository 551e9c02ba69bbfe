use crate::app_packet::{ControlPacket, unix_now};
use crate::connection::ControlHandle;
use crate::error::CoreError;
use log::{trace, warn};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Periodically send `ping` over the control connection until cancelled.
///
/// The first ping goes out one full `interval` after start. A failed send
/// ends the sender with the error so the supervising task can react (the
/// usual reaction is tearing the session down and reconnecting); cancellation
/// ends it cleanly and is safe to request more than once.
pub async fn run_heartbeat(
    handle: ControlHandle,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), CoreError> {
    let mut ticker = tokio::time::interval(interval);
    // interval() fires immediately; swallow that tick so the cadence starts
    // one interval from now.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                trace!("Sending heartbeat ping");
                if let Err(e) = handle.send(ControlPacket::Ping { time: unix_now() }).await {
                    warn!("Heartbeat send failed: {e}");
                    return Err(e);
                }
            }
        }
    }
}
