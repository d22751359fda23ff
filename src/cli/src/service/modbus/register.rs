use std::collections::HashMap;
use std::fmt::Display;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio_modbus::{Address, Quantity};

use super::span::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NumericPointKind {
  pub multiplier: Decimal,
}

/// What a point occupies on the device.
///
/// `U16` and `U32` are holding registers spanning one and two words
/// respectively, scaled by their multiplier. `Coil` is a single bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum PointKind {
  U16(NumericPointKind),
  U32(NumericPointKind),
  Coil,
}

impl PointKind {
  pub fn block(&self) -> BlockKind {
    match self {
      PointKind::U16(_) | PointKind::U32(_) => BlockKind::Registers,
      PointKind::Coil => BlockKind::Coils,
    }
  }

  pub fn words(&self) -> Option<Quantity> {
    match self {
      PointKind::U16(_) => Some(1),
      PointKind::U32(_) => Some(2),
      PointKind::Coil => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointDefinition {
  pub name: String,
  pub address: Address,
  pub kind: PointKind,
  pub unit: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

impl Span for PointDefinition {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.kind.words().unwrap_or(1)
  }
}

impl Span for &PointDefinition {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.kind.words().unwrap_or(1)
  }
}

impl Display for PointDefinition {
  fn fmt(
    &self,
    f: &mut std::fmt::Formatter<'_>,
  ) -> Result<(), std::fmt::Error> {
    write!(f, "{}@{}", self.name, self.address)
  }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MapError {
  #[error("Point name {0:?} is defined more than once")]
  DuplicateName(String),

  #[error("Address {address} is used by both {first:?} and {second:?}")]
  DuplicateAddress {
    address: Address,
    first: String,
    second: String,
  },

  #[error("Point {point:?} does not belong in a {expected:?} map")]
  WrongKind { point: String, expected: BlockKind },
}

/// Ordered, immutable set of points addressed in one block kind.
///
/// Shared read-only between every device that references it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointMap {
  name: String,
  kind: BlockKind,
  points: Vec<PointDefinition>,
  index: HashMap<String, usize>,
}

impl PointMap {
  pub fn new(
    name: impl Into<String>,
    kind: BlockKind,
    points: Vec<PointDefinition>,
  ) -> Result<Self, MapError> {
    let mut index = HashMap::with_capacity(points.len());
    let mut addresses = HashMap::<Address, &str>::with_capacity(points.len());

    for (position, point) in points.iter().enumerate() {
      if point.kind.block() != kind {
        return Err(MapError::WrongKind {
          point: point.name.clone(),
          expected: kind,
        });
      }

      if index.insert(point.name.clone(), position).is_some() {
        return Err(MapError::DuplicateName(point.name.clone()));
      }

      if let Some(first) = addresses.insert(point.address, &point.name) {
        return Err(MapError::DuplicateAddress {
          address: point.address,
          first: first.to_owned(),
          second: point.name.clone(),
        });
      }
    }

    Ok(Self {
      name: name.into(),
      kind,
      points,
      index,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn kind(&self) -> BlockKind {
    self.kind
  }

  pub fn get(&self, name: &str) -> Option<&PointDefinition> {
    self
      .index
      .get(name)
      .and_then(|position| self.points.get(*position))
  }

  pub fn iter(&self) -> impl ExactSizeIterator<Item = &PointDefinition> {
    self.points.iter()
  }

  pub fn len(&self) -> usize {
    self.points.len()
  }

  pub fn is_empty(&self) -> bool {
    self.points.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use rust_decimal_macros::dec;

  use super::*;

  fn register(name: &str, address: Address) -> PointDefinition {
    PointDefinition {
      name: name.to_owned(),
      address,
      kind: PointKind::U16(NumericPointKind {
        multiplier: dec!(0.1),
      }),
      unit: "Hz".to_owned(),
      description: None,
    }
  }

  fn coil(name: &str, address: Address) -> PointDefinition {
    PointDefinition {
      name: name.to_owned(),
      address,
      kind: PointKind::Coil,
      unit: String::new(),
      description: None,
    }
  }

  #[test]
  fn keeps_configured_order() {
    let map = PointMap::new(
      "vfd",
      BlockKind::Registers,
      vec![register("Freq", 10), register("Current", 3)],
    )
    .unwrap();

    let names = map.iter().map(|point| point.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["Freq", "Current"]);
    assert_eq!(map.get("Current").map(|point| point.address), Some(3));
    assert!(map.get("Missing").is_none());
  }

  #[test]
  fn rejects_duplicate_addresses() {
    let error = PointMap::new(
      "vfd",
      BlockKind::Registers,
      vec![register("Freq", 10), register("Speed", 10)],
    )
    .unwrap_err();

    assert_eq!(
      error,
      MapError::DuplicateAddress {
        address: 10,
        first: "Freq".to_owned(),
        second: "Speed".to_owned(),
      }
    );
  }

  #[test]
  fn rejects_duplicate_names() {
    let error = PointMap::new(
      "vfd",
      BlockKind::Registers,
      vec![register("Freq", 10), register("Freq", 11)],
    )
    .unwrap_err();

    assert_eq!(error, MapError::DuplicateName("Freq".to_owned()));
  }

  #[test]
  fn rejects_coils_in_register_maps() {
    let error =
      PointMap::new("vfd", BlockKind::Registers, vec![coil("Run", 0)])
        .unwrap_err();

    assert!(matches!(error, MapError::WrongKind { .. }));
  }

  #[test]
  fn two_word_points_span_two_registers() {
    let point = PointDefinition {
      kind: PointKind::U32(NumericPointKind {
        multiplier: dec!(1),
      }),
      ..register("Energy", 100)
    };

    assert_eq!(point.quantity(), 2);
    assert_eq!(coil("Run", 4).quantity(), 1);
  }
}
