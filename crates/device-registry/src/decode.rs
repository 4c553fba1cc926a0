use crate::{DatapointType, DecodeError, MetricSpec};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const TEMPERATURE_METRIC: MetricSpec = MetricSpec {
    name: "knx_temperature_celsius",
    help: "Current temperature from KNX DPT_9001 datapoint",
};

pub const SWITCH_METRIC: MetricSpec = MetricSpec {
    name: "knx_switch_status",
    help: "Current on/off state from KNX DPT_1001 datapoint",
};

/// A decoded datapoint value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodedValue {
    Bool(bool),
    Float(f64),
}

impl DecodedValue {
    /// Gauge value of this datapoint (`true` is 1.0).
    pub fn as_f64(&self) -> f64 {
        match *self {
            DecodedValue::Bool(b) => f64::from(u8::from(b)),
            DecodedValue::Float(v) => v,
        }
    }
}

impl fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedValue::Bool(b) => write!(f, "{b}"),
            DecodedValue::Float(v) => write!(f, "{v:.2}"),
        }
    }
}

/// Converts raw payloads of one datapoint type.
pub trait DatapointDecoder: Send + Sync {
    fn datapoint(&self) -> DatapointType;

    /// Gauge family decoded values are written to.
    fn metric(&self) -> &MetricSpec;

    fn decode(&self, payload: &[u8]) -> Result<DecodedValue, DecodeError>;
}

/// DPT 9.001: 2-octet float temperature.
#[derive(Debug, Default, Clone, Copy)]
pub struct Dpt9001;

impl DatapointDecoder for Dpt9001 {
    fn datapoint(&self) -> DatapointType {
        DatapointType::TEMPERATURE
    }

    fn metric(&self) -> &MetricSpec {
        &TEMPERATURE_METRIC
    }

    fn decode(&self, payload: &[u8]) -> Result<DecodedValue, DecodeError> {
        decode_dpt9(payload).map(DecodedValue::Float)
    }
}

/// DPT 1.001: switch, least significant bit is the state.
#[derive(Debug, Default, Clone, Copy)]
pub struct Dpt1001;

impl DatapointDecoder for Dpt1001 {
    fn datapoint(&self) -> DatapointType {
        DatapointType::SWITCH
    }

    fn metric(&self) -> &MetricSpec {
        &SWITCH_METRIC
    }

    fn decode(&self, payload: &[u8]) -> Result<DecodedValue, DecodeError> {
        match payload {
            [b] => Ok(DecodedValue::Bool(b & 0x01 == 0x01)),
            _ => Err(DecodeError::Length {
                dpt: DatapointType::SWITCH,
                expected: 1,
                actual: payload.len(),
            }),
        }
    }
}

/// Decode a 2-octet KNX float: `0.01 * M * 2^E`.
///
/// Bit 15 is the sign of the 12-bit two's-complement mantissa M, bits 14-11
/// hold E, bits 10-0 the low mantissa bits. `0x7FFF` marks invalid data.
pub fn decode_dpt9(payload: &[u8]) -> Result<f64, DecodeError> {
    let raw = match payload {
        [hi, lo] => u16::from_be_bytes([*hi, *lo]),
        _ => {
            return Err(DecodeError::Length {
                dpt: DatapointType::TEMPERATURE,
                expected: 2,
                actual: payload.len(),
            })
        }
    };
    if raw == 0x7FFF {
        return Err(DecodeError::InvalidData {
            dpt: DatapointType::TEMPERATURE,
        });
    }
    let exponent = (raw >> 11) & 0x0F;
    let mut mantissa = i32::from(raw & 0x07FF);
    if raw & 0x8000 != 0 {
        mantissa -= 2048;
    }
    Ok(0.01 * f64::from(mantissa) * f64::from(1u32 << exponent))
}

/// Decoders keyed by datapoint type. New types are added with [`register`].
///
/// [`register`]: DecoderTable::register
#[derive(Clone, Default)]
pub struct DecoderTable {
    decoders: HashMap<DatapointType, Arc<dyn DatapointDecoder>>,
}

impl DecoderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the decoders shipped in this crate.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.register(Dpt1001);
        table.register(Dpt9001);
        table
    }

    /// Add or replace the decoder for `decoder.datapoint()`.
    pub fn register(&mut self, decoder: impl DatapointDecoder + 'static) -> &mut Self {
        self.decoders.insert(decoder.datapoint(), Arc::new(decoder));
        self
    }

    pub fn get(&self, dpt: &DatapointType) -> Option<Arc<dyn DatapointDecoder>> {
        self.decoders.get(dpt).cloned()
    }
}

impl fmt::Debug for DecoderTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("DecoderTable").field("types", &types).finish()
    }
}
