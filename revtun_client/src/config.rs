use crate::error::ClientError;
use config::Config;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client-side settings, the `client` section of the config file. Values can
/// be overridden by environment variables with the `REVTUN` prefix.
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Identifier echoed in registration packets.
    pub name: String,
    /// Shared secret presented to the server.
    pub token: String,
    pub server_addr: String,
    /// Local ports behind the tunnel; the first entry is the one mapped.
    pub local_ports: Vec<u16>,
    /// Public port requested on the server.
    pub remote_port: u16,
    pub log_level: String,
    #[serde(deserialize_with = "duration_from_secs")]
    pub heartbeat_interval: Duration,
    #[serde(deserialize_with = "duration_from_secs")]
    pub health_check_interval: Duration,
    /// Pause between reconnection attempts of the outer supervisor loop.
    #[serde(deserialize_with = "duration_from_secs")]
    pub retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "revtun-client-demo".to_owned(),
            token: "changeme".to_owned(),
            server_addr: "127.0.0.1:17000".to_owned(),
            local_ports: vec![22],
            remote_port: 10022,
            log_level: "info".to_owned(),
            heartbeat_interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            retry_interval: Duration::from_secs(3),
        }
    }
}

impl ClientConfig {
    /// The mapped local port: the first configured entry.
    pub fn local_port(&self) -> u16 {
        self.local_ports.first().copied().unwrap_or(22)
    }
}

/// File layout shared with the server binary; the client reads its own
/// section and ignores the rest.
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub client: ClientConfig,
}

impl AppConfig {
    pub fn parse_config(settings_path: &str) -> Result<AppConfig, ClientError> {
        let settings = Config::builder()
            .add_source(config::File::with_name(settings_path).required(false))
            .add_source(config::Environment::with_prefix("REVTUN"))
            .build()?;

        let config = settings.try_deserialize::<AppConfig>()?;

        Ok(config)
    }
}

fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}
