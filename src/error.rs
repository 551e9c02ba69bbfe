use revtun_server::error::ServerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("ServerError -> {0}")]
    ServerError(#[from] ServerError),
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<config::ConfigError> for AppError {
    fn from(value: config::ConfigError) -> Self {
        Self::ConfigError(value.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value.to_string())
    }
}
