use std::fmt::Display;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
  Number(Decimal),
  Bool(bool),
}

impl Display for Value {
  fn fmt(
    &self,
    f: &mut std::fmt::Formatter<'_>,
  ) -> Result<(), std::fmt::Error> {
    match self {
      Value::Number(number) => write!(f, "{}", number),
      Value::Bool(bit) => write!(f, "{}", bit),
    }
  }
}

/// One acquired (or optimistically written) value of a point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reading {
  pub device: String,
  pub point: String,
  pub timestamp: DateTime<Utc>,
  pub raw: u32,
  pub value: Value,
}

impl Reading {
  pub fn kind(&self) -> &'static str {
    match self.value {
      Value::Number(_) => "register",
      Value::Bool(_) => "coil",
    }
  }
}
