use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Server-side settings, usually the `server` section of the config file.
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Control-port bind address.
    pub addr: String,
    /// Shared secret clients must present when registering.
    pub token: String,
    pub log_level: String,
    /// How long a fresh connection may take to send its first packet.
    #[serde(deserialize_with = "duration_from_secs")]
    pub initial_timeout: Duration,
    /// Idle age after which a mapping is reaped.
    #[serde(deserialize_with = "duration_from_secs")]
    pub heartbeat_timeout: Duration,
    /// Cadence of the reaper sweep.
    #[serde(deserialize_with = "duration_from_secs")]
    pub sweep_interval: Duration,
    /// How long an accepted user connection waits for a data channel.
    #[serde(deserialize_with = "duration_from_secs")]
    pub rendezvous_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:17000".to_owned(),
            token: "changeme".to_owned(),
            log_level: "info".to_owned(),
            initial_timeout: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            rendezvous_timeout: Duration::from_secs(60),
        }
    }
}

fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}
