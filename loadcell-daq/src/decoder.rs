//! Register frame decoding.
//!
//! The sensor exposes its load as two 16-bit holding registers, low word
//! first. The measurement is the low 16 bits of the combined 32-bit value,
//! read as a two's-complement `i16`.

use loadcell_common::Measurement;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registers consumed by the decoder.
pub const MIN_FRAME_LEN: usize = 2;

/// Decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Register frame too short: got {len}, need at least {MIN_FRAME_LEN}")]
    FrameTooShort { len: usize },
}

/// How the low and high registers are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeMode {
    /// `(high << 16) | low`, truncated to 16 bits (default).
    #[default]
    Arithmetic,
    /// Unpadded hexadecimal concatenation of high then low, truncated to
    /// 16 bits. Leading zero nibbles of the low word are dropped, so the
    /// high word leaks into the result whenever `low < 0x1000`.
    HexConcat,
}

/// Decode a register frame into a signed measurement.
///
/// Only `frame[0]` (low word) and `frame[1]` (high word) are read; any
/// further registers are ignored.
pub fn decode_measurement(frame: &[u16], mode: DecodeMode) -> Result<Measurement, DecodeError> {
    let &[low, high, ..] = frame else {
        return Err(DecodeError::FrameTooShort { len: frame.len() });
    };

    let combined = match mode {
        DecodeMode::Arithmetic => ((high as u32) << 16) | low as u32,
        DecodeMode::HexConcat => ((high as u32) << (4 * hex_digits(low))) | low as u32,
    };

    Ok(combined as u16 as i16)
}

/// Number of hexadecimal digits needed to print `value` (at least one).
fn hex_digits(value: u16) -> u32 {
    if value == 0 {
        1
    } else {
        (u16::BITS - value.leading_zeros()).div_ceil(4)
    }
}
