//! knx-transport: KNX group telegram abstractions
//!
//! This crate provides the [`GroupBus`] trait and the types flowing through it, with
//! feature-gated backends. The default build enables both the KNXnet/IP tunnelling
//! backend and an in-process `mock` backend so binaries and tests can run without a
//! gateway.

mod types;
pub use types::{
    AddressParseError, GroupAddress, GroupCommand, GroupEvent, IndividualAddress,
};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::{GroupBus, Inbound};

#[cfg(feature = "tunnel")]
mod frame;

#[cfg(feature = "tunnel")]
mod tunnel;

#[cfg(feature = "tunnel")]
pub use tunnel::{GroupTunnel, TunnelConfig};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBus, MockFeed};
