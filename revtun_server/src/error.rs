use revtun_core::error::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("CoreError -> {0}")]
    CoreError(#[from] CoreError),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),
}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value.to_string())
    }
}
