use tokio_modbus::{Address, Quantity};

use super::span::*;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch<TSpan: Span> {
  pub kind: BlockKind,
  pub address: Address,
  pub quantity: Quantity,
  pub spans: Vec<TSpan>,
}

impl<TSpan: Span> Span for Batch<TSpan> {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.quantity
  }
}

impl<TSpan: Span> Span for &Batch<TSpan> {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.quantity
  }
}

impl<TSpan: Span> Batch<TSpan> {
  pub fn simple(&self) -> SimpleSpan {
    SimpleSpan {
      address: self.address,
      quantity: self.quantity,
    }
  }

  /// Slice of a block response that belongs to `span`.
  ///
  /// Returns `None` when the response is too short to contain it.
  pub fn slice<'a, T>(
    &self,
    span: &impl Span,
    data: &'a [T],
  ) -> Option<&'a [T]> {
    let start = span.address().checked_sub(self.address)? as usize;
    let end = start + span.quantity() as usize;
    data.get(start..end)
  }
}

/// Groups spans of one block kind into as few requests as possible.
///
/// Spans are merged into the current batch while the gap to it is below
/// `threshold` and the merged batch stays within the request limit of
/// `kind`.
pub fn batch_spans<TSpan: Span, TIntoIterator: IntoIterator<Item = TSpan>>(
  kind: BlockKind,
  spans: TIntoIterator,
  threshold: u16,
) -> Vec<Batch<TSpan>> {
  let mut spans = spans.into_iter().collect::<Vec<_>>();
  spans.sort_by_key(|span| span.address());

  let mut iter = spans.into_iter();
  let first = match iter.by_ref().next() {
    Some(first) => first,
    None => return Vec::new(),
  };
  let limit = kind.limit() as u32;
  let mut batches = Vec::new();
  let mut current = Batch::<TSpan> {
    kind,
    address: first.address(),
    quantity: first.quantity(),
    spans: vec![first],
  };

  for span in iter {
    let end = current.end();
    let gap = (span.address() as u32).saturating_sub(end);
    let merged = span.end().max(end) - current.address as u32;
    if gap < threshold as u32 && merged <= limit {
      current.quantity = merged as Quantity;
      current.spans.push(span);
    } else {
      batches.push(current);
      current = Batch::<TSpan> {
        kind,
        address: span.address(),
        quantity: span.quantity(),
        spans: vec![span],
      }
    }
  }
  batches.push(current);

  batches
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn span(address: Address, quantity: Quantity) -> SimpleSpan {
    SimpleSpan { address, quantity }
  }

  fn bounds(batches: &[Batch<SimpleSpan>]) -> Vec<(Address, Quantity)> {
    batches
      .iter()
      .map(|batch| (batch.address, batch.quantity))
      .collect()
  }

  #[test]
  fn merges_close_spans_and_splits_far_ones() {
    let batches = batch_spans(
      BlockKind::Registers,
      vec![span(20, 2), span(0, 1), span(2, 1), span(3, 2)],
      3,
    );

    assert_eq!(bounds(&batches), vec![(0, 5), (20, 2)]);
    assert_eq!(batches[0].spans.len(), 3);
  }

  #[test]
  fn threshold_of_zero_keeps_every_span_apart() {
    let batches = batch_spans(
      BlockKind::Registers,
      vec![span(0, 1), span(1, 1)],
      0,
    );

    assert_eq!(bounds(&batches), vec![(0, 1), (1, 1)]);
  }

  #[test]
  fn never_exceeds_request_limit() {
    let spans = (0..130).map(|address| span(address, 1)).collect::<Vec<_>>();
    let batches = batch_spans(BlockKind::Registers, spans, 3);

    assert_eq!(bounds(&batches), vec![(0, 125), (125, 5)]);

    let coils = (0..130).map(|address| span(address, 1)).collect::<Vec<_>>();
    let batches = batch_spans(BlockKind::Coils, coils, 3);
    assert_eq!(bounds(&batches), vec![(0, 130)]);
  }

  #[test]
  fn overlapping_spans_do_not_underflow() {
    let batches = batch_spans(
      BlockKind::Registers,
      vec![span(10, 2), span(11, 1)],
      1,
    );

    assert_eq!(bounds(&batches), vec![(10, 2)]);
  }

  #[test]
  fn slices_response_per_span() {
    let batch = batch_spans(
      BlockKind::Registers,
      vec![span(10, 1), span(12, 2)],
      3,
    )
    .remove(0);
    let data = [1u16, 2, 3, 4];

    assert_eq!(batch.slice(&span(12, 2), &data), Some(&data[2..4]));
    assert_eq!(batch.slice(&span(12, 2), &data[..3]), None);
    assert_eq!(batch.slice(&span(9, 1), &data), None);
  }

  #[test]
  fn empty_input_yields_no_batches() {
    let batches =
      batch_spans(BlockKind::Coils, Vec::<SimpleSpan>::new(), 3);

    assert!(batches.is_empty());
  }
}
