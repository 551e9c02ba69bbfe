use revtun_core::error::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("CoreError -> {0}")]
    CoreError(#[from] CoreError),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("control channel disconnected")]
    Disconnected,
    #[error("session task failed: {0}")]
    Task(String),
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for ClientError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value.to_string())
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(value: config::ConfigError) -> Self {
        Self::ConfigError(value.to_string())
    }
}
