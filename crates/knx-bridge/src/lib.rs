//! knx-bridge: moves KNX group telegrams into metric series
//!
//! A [`Bridge`] owns the shared state of a running exporter (the immutable device
//! registry and the metric store) and hands out the two workers that act on it:
//! the [`Dispatcher`], which consumes the inbound telegram stream, and the
//! [`StartupPoller`], which asks every device for its current value once.

mod error;
pub use error::{PollError, UpdateError};

mod dispatch;
pub use dispatch::{update_from_event, DispatchConfig, DispatchStats, Dispatcher};

mod poller;
pub use poller::{FailurePolicy, PollReport, PollerConfig, StartupPoller};

use device_registry::{DeviceRegistry, MetricStore};
use std::sync::Arc;

/// Shared state of one exporter process.
#[derive(Clone)]
pub struct Bridge {
    registry: Arc<DeviceRegistry>,
    store: Arc<MetricStore>,
}

impl Bridge {
    pub fn new(registry: DeviceRegistry, store: MetricStore) -> Self {
        store.bridge().devices_loaded.set(registry.len() as i64);
        Self {
            registry: Arc::new(registry),
            store: Arc::new(store),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    pub fn dispatcher(&self, config: DispatchConfig) -> Dispatcher {
        Dispatcher::new(self.registry.clone(), self.store.clone(), config)
    }

    pub fn poller(&self, config: PollerConfig) -> StartupPoller {
        StartupPoller::new(self.registry.clone(), self.store.clone(), config)
    }
}
