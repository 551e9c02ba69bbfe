use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("short read: {0}")]
    ShortRead(String),
    #[error("write error: {0}")]
    WriteError(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("encode error: {0}")]
    EncodeError(String),
    #[error("connect error: {0}")]
    ConnectError(String),
    #[error("connection timed out")]
    ConnectTimeout,
    #[error("connection closed")]
    ConnectionClosed,
}
