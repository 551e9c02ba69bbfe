use crate::error::AppError;
use config::Config;
use revtun_server::config::ServerConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration file layout.
///
/// The same file serves both peers; the server binary reads the `server`
/// section and ignores the rest. Values can be overridden by environment
/// variables with the `REVTUN` prefix.
#[derive(Debug, Serialize, Deserialize, Clone, Eq, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn parse_config(settings_path: &str) -> Result<AppConfig, AppError> {
        let settings = Config::builder()
            .add_source(config::File::with_name(settings_path).required(false))
            .add_source(config::Environment::with_prefix("REVTUN"))
            .build()?;

        let config = settings.try_deserialize::<AppConfig>()?;

        Ok(config)
    }
}
