use crate::DatapointType;
use knx_transport::GroupAddress;
use thiserror::Error;

/// Device configuration that cannot be turned into a registry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("group address {address} is used by both `{first}` and `{second}`")]
    DuplicateAddress {
        address: GroupAddress,
        first: String,
        second: String,
    },
    #[error("device `{name}`: address {main}/{middle}/{sub} is outside 0-31/0-7/0-255")]
    InvalidAddress {
        name: String,
        main: u8,
        middle: u8,
        sub: u8,
    },
    #[error("device `{name}`: unrecognised datapoint type `{tag}`")]
    InvalidDatapointType { name: String, tag: String },
    #[error("device `{name}`: no decoder registered for DPT {dpt}")]
    UnknownDatapointType { name: String, dpt: DatapointType },
}

/// Payload that does not match its datapoint encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("DPT {dpt}: expected {expected} byte payload, got {actual}")]
    Length {
        dpt: DatapointType,
        expected: usize,
        actual: usize,
    },
    #[error("DPT {dpt}: payload carries the invalid-data marker")]
    InvalidData { dpt: DatapointType },
}

/// Value that cannot be represented in a datapoint encoding.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("value is not finite")]
    NotFinite,
    #[error("{value} is outside the range of DPT {dpt}")]
    OutOfRange { dpt: DatapointType, value: f64 },
}

#[derive(Debug, Error)]
#[error("metrics error: {0}")]
pub struct MetricsError(#[from] pub prometheus::Error);
