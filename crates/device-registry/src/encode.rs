use crate::{DatapointType, EncodeError};

// Largest magnitude DPT 9 can carry: 0.01 * 2047 * 2^15.
const DPT9_MAX: f64 = 670_760.96;
const DPT9_INVALID: u16 = 0x7FFF;

/// Encode a 2-octet float (DPT 9.xxx) using the smallest exponent that fits.
pub fn encode_dpt9(value: f64) -> Result<[u8; 2], EncodeError> {
    if !value.is_finite() {
        return Err(EncodeError::NotFinite);
    }
    let out_of_range = EncodeError::OutOfRange {
        dpt: DatapointType::TEMPERATURE,
        value,
    };
    if value.abs() > DPT9_MAX {
        return Err(out_of_range);
    }
    let scaled = value * 100.0;
    for exp in 0u16..=15 {
        let mantissa = (scaled / f64::from(1u32 << exp)).round();
        if !(-2048.0..=2047.0).contains(&mantissa) {
            continue;
        }
        let m = mantissa as i32;
        let sign = if m < 0 { 0x8000 } else { 0 };
        let raw = sign | (exp << 11) | (m & 0x07FF) as u16;
        if raw == DPT9_INVALID {
            return Err(out_of_range);
        }
        return Ok(raw.to_be_bytes());
    }
    Err(out_of_range)
}

/// Encode a boolean (DPT 1.xxx) as a single packed byte.
pub fn encode_dpt1(value: bool) -> [u8; 1] {
    [u8::from(value)]
}
