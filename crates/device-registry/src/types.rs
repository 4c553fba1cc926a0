use crate::ConfigError;
use knx_transport::GroupAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Top-level shape of the device file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicesFile {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// One device entry as written in the device file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub maingroup: u8,
    pub middlegroup: u8,
    pub subgroup: u8,
    pub r#type: String,
}

impl DeviceConfig {
    /// Validate the address range and datapoint tag.
    pub fn into_descriptor(self) -> Result<DeviceDescriptor, ConfigError> {
        let address = GroupAddress::new(self.maingroup, self.middlegroup, self.subgroup)
            .ok_or_else(|| ConfigError::InvalidAddress {
                name: self.name.clone(),
                main: self.maingroup,
                middle: self.middlegroup,
                sub: self.subgroup,
            })?;
        let dpt = self
            .r#type
            .parse()
            .map_err(|_| ConfigError::InvalidDatapointType {
                name: self.name.clone(),
                tag: self.r#type.clone(),
            })?;
        Ok(DeviceDescriptor {
            name: self.name,
            address,
            dpt,
        })
    }
}

/// A configured device: one group address with a known datapoint type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub address: GroupAddress,
    pub dpt: DatapointType,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, address: GroupAddress, dpt: DatapointType) -> Self {
        Self {
            name: name.into(),
            address,
            dpt,
        }
    }
}

/// KNX datapoint type identifier, `main.sub` (e.g. 9.001).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatapointType {
    pub main: u16,
    pub sub: u16,
}

impl DatapointType {
    /// DPT 1.001, switch on/off
    pub const SWITCH: Self = Self::new(1, 1);
    /// DPT 9.001, temperature in °C
    pub const TEMPERATURE: Self = Self::new(9, 1);

    pub const fn new(main: u16, sub: u16) -> Self {
        Self { main, sub }
    }
}

impl fmt::Display for DatapointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.main, self.sub)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognised datapoint type tag: {0}")]
pub struct DatapointParseError(pub String);

impl FromStr for DatapointType {
    type Err = DatapointParseError;

    /// Accepts `DPT_9001`, `9.001` and `DPST-9-1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DatapointParseError(s.to_string());
        let t = s.trim();
        let upper = t.to_ascii_uppercase();
        let (main, sub) = if let Some(rest) = upper.strip_prefix("DPST-") {
            rest.split_once('-').ok_or_else(err)?
        } else if let Some((main, sub)) = t.split_once('.') {
            (main, sub)
        } else {
            let digits = upper
                .strip_prefix("DPT_")
                .or_else(|| upper.strip_prefix("DPT"))
                .ok_or_else(err)?;
            if digits.len() < 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            digits.split_at(digits.len() - 3)
        };
        let main = main.parse::<u16>().map_err(|_| err())?;
        let sub = sub.parse::<u16>().map_err(|_| err())?;
        Ok(DatapointType::new(main, sub))
    }
}
