use tokio_modbus::{Address, Quantity};

pub trait Span {
  fn address(&self) -> Address;

  fn quantity(&self) -> Quantity;

  fn end(&self) -> u32 {
    self.address() as u32 + self.quantity() as u32
  }
}

/// Which table of the device a span addresses.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum BlockKind {
  Registers,
  Coils,
}

impl BlockKind {
  /// Largest quantity a single request may carry.
  pub fn limit(&self) -> Quantity {
    match self {
      BlockKind::Registers => 125,
      BlockKind::Coils => 2000,
    }
  }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SimpleSpan {
  pub address: Address,
  pub quantity: Quantity,
}

impl Span for SimpleSpan {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.quantity
  }
}

impl Span for &SimpleSpan {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.quantity
  }
}
