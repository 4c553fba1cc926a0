use device_registry::{DecodeError, MetricsError};
use knx_transport::{GroupAddress, TransportError};
use thiserror::Error;

/// Why a single telegram did not update its series.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("read request to `{name}` ({address}) failed: {source}")]
    Send {
        name: String,
        address: GroupAddress,
        #[source]
        source: TransportError,
    },
}
