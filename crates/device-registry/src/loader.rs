use crate::decode::{DatapointDecoder, DecodedValue, DecoderTable};
use crate::metrics::{MetricSpec, SeriesLabels};
use crate::types::{DeviceConfig, DeviceDescriptor, DevicesFile};
use crate::{ConfigError, DecodeError};
use anyhow::Context;
use knx_transport::GroupAddress;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A registered device with its decoder resolved.
#[derive(Clone)]
pub struct Device {
    descriptor: DeviceDescriptor,
    decoder: Arc<dyn DatapointDecoder>,
    labels: SeriesLabels,
}

impl Device {
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn labels(&self) -> &SeriesLabels {
        &self.labels
    }

    pub fn metric(&self) -> &MetricSpec {
        self.decoder.metric()
    }

    pub fn decode(&self, payload: &[u8]) -> Result<DecodedValue, DecodeError> {
        self.decoder.decode(payload)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.descriptor.name)
            .field("address", &self.descriptor.address.to_string())
            .field("dpt", &self.descriptor.dpt.to_string())
            .finish()
    }
}

/// Immutable map from group address to device, in configuration order.
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    index: HashMap<GroupAddress, usize>,
}

impl DeviceRegistry {
    /// Build the registry, rejecting duplicate addresses and datapoint types
    /// without a decoder.
    pub fn build(
        descriptors: impl IntoIterator<Item = DeviceDescriptor>,
        decoders: &DecoderTable,
    ) -> Result<Self, ConfigError> {
        let mut reg = DeviceRegistry::default();
        for descriptor in descriptors {
            if let Some(&i) = reg.index.get(&descriptor.address) {
                return Err(ConfigError::DuplicateAddress {
                    address: descriptor.address,
                    first: reg.devices[i].descriptor.name.clone(),
                    second: descriptor.name,
                });
            }
            let decoder =
                decoders
                    .get(&descriptor.dpt)
                    .ok_or_else(|| ConfigError::UnknownDatapointType {
                        name: descriptor.name.clone(),
                        dpt: descriptor.dpt,
                    })?;
            let labels = SeriesLabels::for_device(&descriptor);
            reg.index.insert(descriptor.address, reg.devices.len());
            reg.devices.push(Device {
                descriptor,
                decoder,
                labels,
            });
        }
        Ok(reg)
    }

    pub fn lookup(&self, address: &GroupAddress) -> Option<&Device> {
        self.index.get(address).map(|&i| &self.devices[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> + '_ {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

pub fn load_device_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<DeviceConfig>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading device file: {}", path.display()))?;
    let file: DevicesFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("parsing device file: {}", path.display()))?;
    debug!(path = %path.display(), devices = file.devices.len(), "device file loaded");
    Ok(file.devices)
}

/// Load a device file and build the registry from it.
pub fn load_registry(
    path: impl AsRef<Path>,
    decoders: &DecoderTable,
) -> anyhow::Result<DeviceRegistry> {
    let path = path.as_ref();
    let descriptors = load_device_file(path)?
        .into_iter()
        .map(DeviceConfig::into_descriptor)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("validating device file: {}", path.display()))?;
    let registry = DeviceRegistry::build(descriptors, decoders)
        .with_context(|| format!("building registry: {}", path.display()))?;
    Ok(registry)
}
