use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::*;

use super::modbus::Reading;

/// Optional per-device CSV mirror of persisted readings.
#[derive(Debug, Clone)]
pub(crate) struct Service {
  dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ExportError {
  #[error("Failed writing csv file")]
  Io(#[from] std::io::Error),

  #[error("Failed encoding csv record")]
  Csv(#[from] csv::Error),

  #[error("Export task failed")]
  Join(#[from] tokio::task::JoinError),
}

impl service::Service for Service {
  fn new(config: &config::Values) -> Self {
    Self {
      dir: config.persistence.csv_dir.as_ref().map(PathBuf::from),
    }
  }
}

impl Service {
  /// Appends readings to `<dir>/<device>.csv`, writing a header for new
  /// files. Does nothing when no directory is configured.
  ///
  /// Device ids are checked at load time to be plain file names.
  #[tracing::instrument(skip_all, fields(count = readings.len()))]
  pub(crate) async fn append(
    &self,
    readings: Vec<Reading>,
  ) -> Result<(), ExportError> {
    let dir = match &self.dir {
      Some(dir) => dir.clone(),
      None => return Ok(()),
    };
    if readings.is_empty() {
      return Ok(());
    }

    tokio::task::spawn_blocking(move || write(&dir, readings)).await??;

    tracing::trace!("Exported readings");

    Ok(())
  }
}

fn write(dir: &Path, readings: Vec<Reading>) -> Result<(), ExportError> {
  std::fs::create_dir_all(dir)?;

  let groups = readings
    .into_iter()
    .into_group_map_by(|reading| reading.device.clone());
  for (device, readings) in groups {
    let path = dir.join(format!("{device}.csv"));
    let exists = path.exists();
    let file = std::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&path)?;
    let mut writer = csv::WriterBuilder::new()
      .has_headers(false)
      .from_writer(file);

    if !exists {
      writer.write_record(["timestamp", "point", "value"])?;
    }
    for reading in readings {
      writer.write_record([
        reading.timestamp.to_rfc3339(),
        reading.point,
        reading.value.to_string(),
      ])?;
    }
    writer.flush()?;
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use rust_decimal_macros::dec;

  use super::*;
  use crate::service::modbus::Value;

  fn reading(device: &str, point: &str, value: Value) -> Reading {
    Reading {
      device: device.to_owned(),
      point: point.to_owned(),
      timestamp: chrono::DateTime::from_timestamp(0, 0).unwrap(),
      raw: 0,
      value,
    }
  }

  #[tokio::test]
  async fn appends_per_device_with_single_header() {
    let dir = tempfile::tempdir().unwrap();
    let service = Service {
      dir: Some(dir.path().join("csv")),
    };

    service
      .append(vec![
        reading("pump", "Freq", Value::Number(dec!(50.0))),
        reading("fan_1", "Run", Value::Bool(true)),
      ])
      .await
      .unwrap();
    service
      .append(vec![reading("pump", "Freq", Value::Number(dec!(51)))])
      .await
      .unwrap();

    let pump =
      std::fs::read_to_string(dir.path().join("csv").join("pump.csv")).unwrap();
    assert_eq!(
      pump.lines().collect::<Vec<_>>(),
      vec![
        "timestamp,point,value",
        "1970-01-01T00:00:00+00:00,Freq,50.0",
        "1970-01-01T00:00:00+00:00,Freq,51",
      ]
    );

    let fan =
      std::fs::read_to_string(dir.path().join("csv").join("fan_1.csv"))
        .unwrap();
    assert_eq!(fan.lines().count(), 2);
  }

  #[tokio::test]
  async fn does_nothing_without_directory() {
    let service = Service { dir: None };

    service
      .append(vec![reading("pump", "Freq", Value::Bool(false))])
      .await
      .unwrap();
  }
}
