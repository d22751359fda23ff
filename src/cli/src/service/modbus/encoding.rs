//! Conversion between raw register words and engineering values.
//!
//! Multi-word values use big-endian word order: the first word read from
//! the device is the most significant one. Each word is itself big-endian
//! on the wire, which the protocol client already resolves into a `u16`.
//! Devices that swap words are not supported by this convention and need to
//! be confirmed against real hardware before deployment.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use super::register::*;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodingError {
  #[error("Expected {expected} words but got {actual}")]
  WordCount { expected: usize, actual: usize },

  #[error("Point {0:?} is a coil and has no word encoding")]
  NotNumeric(String),

  #[error("Value {0} is negative and the field is unsigned")]
  Negative(Decimal),

  #[error("Value {value} does not fit into {bits} bits")]
  Overflow { value: Decimal, bits: u8 },

  #[error("Scaling {value} by {multiplier} failed")]
  Scaling { value: Decimal, multiplier: Decimal },
}

fn numeric(
  definition: &PointDefinition,
) -> Result<(usize, Decimal), EncodingError> {
  match definition.kind {
    PointKind::U16(NumericPointKind { multiplier }) => Ok((1, multiplier)),
    PointKind::U32(NumericPointKind { multiplier }) => Ok((2, multiplier)),
    PointKind::Coil => Err(EncodingError::NotNumeric(definition.name.clone())),
  }
}

/// Combines one or two words into the raw unsigned integer they carry.
pub fn decode_raw(words: &[u16]) -> Result<u32, EncodingError> {
  match *words {
    [word] => Ok(word as u32),
    [high, low] => Ok(((high as u32) << 16) | low as u32),
    _ => Err(EncodingError::WordCount {
      expected: 2,
      actual: words.len(),
    }),
  }
}

/// Scales the raw words of a register point into its engineering value.
pub fn decode(
  words: &[u16],
  definition: &PointDefinition,
) -> Result<Decimal, EncodingError> {
  let (count, multiplier) = numeric(definition)?;
  if words.len() != count {
    return Err(EncodingError::WordCount {
      expected: count,
      actual: words.len(),
    });
  }

  let raw = Decimal::from(decode_raw(words)?);
  raw
    .checked_mul(multiplier)
    .map(|value| value.normalize())
    .ok_or(EncodingError::Scaling {
      value: raw,
      multiplier,
    })
}

pub fn decode_coil(bit: bool) -> bool {
  bit
}

/// Inverse of [`decode`]: unscales, rounds half away from zero and splits
/// into words, most significant first.
pub fn encode(
  value: Decimal,
  definition: &PointDefinition,
) -> Result<Vec<u16>, EncodingError> {
  let (count, multiplier) = numeric(definition)?;
  let raw = value
    .checked_div(multiplier)
    .ok_or(EncodingError::Scaling { value, multiplier })?
    .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);

  if raw.is_sign_negative() && !raw.is_zero() {
    return Err(EncodingError::Negative(value));
  }

  match count {
    1 => raw
      .to_u16()
      .map(|word| vec![word])
      .ok_or(EncodingError::Overflow { value, bits: 16 }),
    _ => raw
      .to_u32()
      .map(|raw| vec![(raw >> 16) as u16, (raw & 0xFFFF) as u16])
      .ok_or(EncodingError::Overflow { value, bits: 32 }),
  }
}
