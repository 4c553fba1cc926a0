use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),
    #[error("gateway rejected connection (status 0x{0:02X})")]
    ConnectRejected(u8),
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("payload too long for a standard frame ({0} bytes)")]
    PayloadTooLong(usize),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("connection closed")]
    Closed,
}
