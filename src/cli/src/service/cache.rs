use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};

use crate::*;

use super::modbus::Reading;

type Key = (String, String);

/// Latest reading per device and point.
///
/// Lives only in memory. Entries are replaced, never removed, so a device
/// that stops answering keeps serving its last values.
#[derive(Debug, Clone)]
pub struct Service {
  readings: Arc<DashMap<Key, Reading>>,
}

impl service::Service for Service {
  fn new(_config: &config::Values) -> Self {
    Self {
      readings: Arc::new(DashMap::new()),
    }
  }
}

impl Service {
  /// Stores `reading` unless a newer one is already cached for its key.
  ///
  /// Returns whether the cache changed.
  pub fn put(&self, reading: Reading) -> bool {
    let key = (reading.device.clone(), reading.point.clone());
    match self.readings.entry(key) {
      Entry::Occupied(mut entry) => {
        if entry.get().timestamp > reading.timestamp {
          tracing::trace!(
            "Ignored stale reading for {} {}",
            reading.device,
            reading.point
          );
          return false;
        }
        entry.insert(reading);
      }
      Entry::Vacant(entry) => {
        entry.insert(reading);
      }
    }

    true
  }

  pub fn put_all(&self, readings: impl IntoIterator<Item = Reading>) {
    for reading in readings {
      self.put(reading);
    }
  }

  pub fn get(&self, device: &str, point: &str) -> Option<Reading> {
    self
      .readings
      .get(&(device.to_owned(), point.to_owned()))
      .map(|reading| reading.value().clone())
  }

  /// Every cached reading ordered by device and point.
  pub fn get_all(&self) -> Vec<Reading> {
    let mut readings = self
      .readings
      .iter()
      .map(|reading| reading.value().clone())
      .collect::<Vec<_>>();
    readings.sort_by(|lhs, rhs| {
      (&lhs.device, &lhs.point).cmp(&(&rhs.device, &rhs.point))
    });
    readings
  }

  pub fn device(&self, device: &str) -> Vec<Reading> {
    let mut readings = self
      .readings
      .iter()
      .filter(|reading| reading.key().0 == device)
      .map(|reading| reading.value().clone())
      .collect::<Vec<_>>();
    readings.sort_by(|lhs, rhs| lhs.point.cmp(&rhs.point));
    readings
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use rust_decimal_macros::dec;

  use super::*;
  use crate::service::modbus::Value;

  fn cache() -> Service {
    Service {
      readings: Arc::new(DashMap::new()),
    }
  }

  fn reading(point: &str, seconds: i64, value: Value) -> Reading {
    Reading {
      device: "pump".to_owned(),
      point: point.to_owned(),
      timestamp: chrono::DateTime::from_timestamp(seconds, 0).unwrap(),
      raw: 0,
      value,
    }
  }

  #[test]
  fn replaces_with_newer_readings_only() {
    let cache = cache();

    assert!(cache.put(reading("Freq", 10, Value::Number(dec!(50)))));
    assert!(cache.put(reading("Freq", 20, Value::Number(dec!(51)))));
    assert!(!cache.put(reading("Freq", 15, Value::Number(dec!(49)))));

    let cached = cache.get("pump", "Freq").unwrap();
    assert_eq!(cached.value, Value::Number(dec!(51)));
    assert_eq!(cached.timestamp.timestamp(), 20);
    assert_eq!(cache.get_all().len(), 1);
  }

  #[test]
  fn lists_readings_in_key_order() {
    let cache = cache();
    cache.put_all(vec![
      reading("Run", 1, Value::Bool(true)),
      reading("Freq", 1, Value::Number(dec!(50))),
    ]);

    let points = cache
      .get_all()
      .into_iter()
      .map(|reading| reading.point)
      .collect::<Vec<_>>();
    assert_eq!(points, vec!["Freq", "Run"]);
    assert_eq!(cache.device("pump").len(), 2);
    assert!(cache.device("fan").is_empty());
    assert!(cache.get("fan", "Freq").is_none());
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_writers_never_regress() {
    let cache = cache();
    let writers = (0..8)
      .map(|writer| {
        let cache = cache.clone();
        tokio::spawn(async move {
          for step in 0..200 {
            let seconds = step * 8 + writer;
            cache.put(reading("Freq", seconds, Value::Number(dec!(1))));
          }
        })
      })
      .collect::<Vec<_>>();

    let mut last = 0;
    for _ in 0..200 {
      if let Some(reading) = cache.get("pump", "Freq") {
        assert!(reading.timestamp.timestamp() >= last);
        last = reading.timestamp.timestamp();
      }
      tokio::task::yield_now().await;
    }

    for writer in writers {
      writer.await.unwrap();
    }
    assert_eq!(
      cache.get("pump", "Freq").unwrap().timestamp.timestamp(),
      199 * 8 + 7
    );
  }
}
