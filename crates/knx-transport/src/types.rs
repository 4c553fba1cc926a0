use core::fmt;
use core::str::FromStr;
use time::OffsetDateTime;

/// 3-level KNX group address (main/middle/sub)
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct GroupAddress {
    raw: u16,
}

impl GroupAddress {
    pub const MAX_MAIN: u8 = 31;
    pub const MAX_MIDDLE: u8 = 7;

    /// Build from the three components; `None` if main > 31 or middle > 7.
    pub fn new(main: u8, middle: u8, sub: u8) -> Option<Self> {
        if main > Self::MAX_MAIN || middle > Self::MAX_MIDDLE {
            return None;
        }
        Some(Self {
            raw: (u16::from(main) << 11) | (u16::from(middle) << 8) | u16::from(sub),
        })
    }

    pub fn from_raw(raw: u16) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> u16 {
        self.raw
    }
    pub fn main(&self) -> u8 {
        ((self.raw >> 11) & 0x1F) as u8
    }
    pub fn middle(&self) -> u8 {
        ((self.raw >> 8) & 0x07) as u8
    }
    pub fn sub(&self) -> u8 {
        (self.raw & 0xFF) as u8
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl FromStr for GroupAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('/');
        let mut next = || -> Result<u8, AddressParseError> {
            parts
                .next()
                .ok_or_else(|| AddressParseError(s.to_string()))?
                .parse::<u8>()
                .map_err(|_| AddressParseError(s.to_string()))
        };
        let (main, middle, sub) = (next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(AddressParseError(s.to_string()));
        }
        GroupAddress::new(main, middle, sub).ok_or_else(|| AddressParseError(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid group address: {0}")]
pub struct AddressParseError(pub String);

/// Physical address of a bus device (area.line.device)
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct IndividualAddress {
    raw: u16,
}

impl IndividualAddress {
    pub fn from_raw(raw: u16) -> Self {
        Self { raw }
    }
    pub fn raw(&self) -> u16 {
        self.raw
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.raw >> 12,
            (self.raw >> 8) & 0x0F,
            self.raw & 0xFF
        )
    }
}

/// Group service carried by a telegram
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum GroupCommand {
    Read,
    Response,
    Write,
}

impl GroupCommand {
    /// APCI bits (10-bit field, upper byte part included)
    pub(crate) fn apci(self) -> u16 {
        match self {
            GroupCommand::Read => 0x000,
            GroupCommand::Response => 0x040,
            GroupCommand::Write => 0x080,
        }
    }

    pub(crate) fn from_apci(apci: u16) -> Option<Self> {
        match apci & 0x3C0 {
            0x000 => Some(GroupCommand::Read),
            0x040 => Some(GroupCommand::Response),
            0x080 => Some(GroupCommand::Write),
            _ => None,
        }
    }
}

/// One group telegram seen on (or sent to) the bus.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupEvent {
    pub command: GroupCommand,
    pub source: IndividualAddress,
    pub destination: GroupAddress,
    /// Application payload. Values of 6 bits or less arrive as one byte.
    pub data: Vec<u8>,
    pub received_at: Option<OffsetDateTime>,
}

impl GroupEvent {
    /// A GroupValueRead request for `destination`.
    pub fn read(destination: GroupAddress) -> Self {
        Self {
            command: GroupCommand::Read,
            source: IndividualAddress::default(),
            destination,
            data: Vec::new(),
            received_at: None,
        }
    }

    pub fn write(destination: GroupAddress, data: &[u8]) -> Self {
        Self {
            command: GroupCommand::Write,
            source: IndividualAddress::default(),
            destination,
            data: data.to_vec(),
            received_at: None,
        }
    }

    pub fn response(destination: GroupAddress, data: &[u8]) -> Self {
        Self {
            command: GroupCommand::Response,
            ..Self::write(destination, data)
        }
    }
}
