use crate::UpdateError;
use device_registry::{DecodedValue, Device, DeviceRegistry, MetricStore};
use knx_transport::{GroupCommand, GroupEvent, Inbound};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, trace, warn};

/// Dispatcher tuning.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Upper bound on concurrently running decode-update units. When reached
    /// the dispatch loop waits for a unit to finish before taking the next
    /// telegram off the inbound stream.
    pub max_in_flight: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { max_in_flight: 64 }
    }
}

/// Counts of what the dispatch loop did with the telegrams it consumed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    /// Telegrams handed to a decode-update unit.
    pub dispatched: u64,
    /// Telegrams for addresses no device is configured on.
    pub unmatched: u64,
    /// Read requests for configured devices; they carry no value.
    pub reads_ignored: u64,
}

/// Routes inbound telegrams to the device they address.
pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    store: Arc<MetricStore>,
    limiter: Arc<Semaphore>,
    max_in_flight: u32,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        store: Arc<MetricStore>,
        config: DispatchConfig,
    ) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        Self {
            registry,
            store,
            limiter: Arc::new(Semaphore::new(max_in_flight as usize)),
            max_in_flight,
        }
    }

    /// Consume `inbound` until the transport closes it.
    ///
    /// In-flight units are awaited before returning.
    pub async fn run(&self, mut inbound: Inbound) -> DispatchStats {
        let mut stats = DispatchStats::default();
        while let Some(event) = inbound.recv().await {
            stats.received += 1;
            self.store.bridge().telegrams_received.inc();
            let device = match self.registry.lookup(&event.destination) {
                Some(device) => device.clone(),
                None => {
                    trace!(destination = %event.destination, "no device for telegram");
                    stats.unmatched += 1;
                    continue;
                }
            };
            self.store.bridge().telegrams_matched.inc();
            if event.command == GroupCommand::Read {
                trace!(destination = %event.destination, "ignoring group read");
                stats.reads_ignored += 1;
                continue;
            }
            let permit = match self.limiter.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            stats.dispatched += 1;
            let store = self.store.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let outcome = update_from_event(&store, &device, &event);
                report(&store, &device, &event, outcome);
            });
        }
        debug!(?stats, "inbound stream closed");
        if let Err(e) = self.limiter.acquire_many(self.max_in_flight).await {
            warn!(error = %e, "could not wait for in-flight updates");
        }
        stats
    }
}

/// Decode `event` for `device` and write the value to its series.
///
/// Nothing is written when decoding fails.
pub fn update_from_event(
    store: &MetricStore,
    device: &Device,
    event: &GroupEvent,
) -> Result<DecodedValue, UpdateError> {
    let value = device.decode(&event.data)?;
    store.upsert(device.metric(), device.labels(), value.as_f64())?;
    Ok(value)
}

fn report(
    store: &MetricStore,
    device: &Device,
    event: &GroupEvent,
    outcome: Result<DecodedValue, UpdateError>,
) {
    let desc = device.descriptor();
    match outcome {
        Ok(value) => debug!(
            device = %desc.name,
            address = %desc.address,
            source = %event.source,
            %value,
            "series updated"
        ),
        Err(UpdateError::Decode(e)) => {
            store.bridge().decode_errors.inc();
            warn!(
                device = %desc.name,
                address = %desc.address,
                payload = ?event.data,
                error = %e,
                "dropping undecodable telegram"
            );
        }
        Err(UpdateError::Metrics(e)) => {
            error!(device = %desc.name, error = %e, "failed to update series");
        }
    }
}
