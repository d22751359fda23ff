use std::{collections::HashMap, sync::Arc};

use tokio_modbus::Address;

use crate::*;

use super::batch::*;
use super::client::Connector;
use super::connection::{
  Block, ConnectError, DeviceStatus, Params, Payload, ReadError, WriteError,
};
use super::encoding::*;
use super::record::*;
use super::register::*;
use super::span::*;
use super::worker::*;

/// Owns one worker per configured device.
///
/// The device set is fixed at startup so lookups need no locking.
#[derive(Clone, Debug)]
pub struct Service {
  devices: Arc<HashMap<String, Device>>,
  ids: Arc<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceReadError {
  #[error("No device in registry for id {0:?}")]
  DeviceNotFound(String),

  #[error("Connection failed")]
  Connect(#[from] ConnectError),

  #[error("Read failed")]
  Read(#[from] ReadError),

  #[error("Parsing failure for point {point:?}")]
  ParsingFailed {
    point: String,
    #[source]
    error: EncodingError,
  },

  #[error("Response did not match the requested blocks")]
  Mismatch,

  #[error("Device worker failure")]
  Worker(anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceWriteError {
  #[error("No device in registry for id {0:?}")]
  DeviceNotFound(String),

  #[error("Connection failed")]
  Connect(#[from] ConnectError),

  #[error("Write failed")]
  Write(#[from] WriteError),

  #[error("Device worker failure")]
  Worker(anyhow::Error),
}

impl Service {
  pub(crate) fn new(
    config: &config::Values,
    connector: Arc<dyn Connector>,
  ) -> Self {
    let params = Params::new(
      config.modbus.connect_timeout,
      config.modbus.request_timeout,
    );

    let mut devices = HashMap::with_capacity(config.devices.len());
    let mut ids = Vec::with_capacity(config.devices.len());
    for device in config.devices.iter() {
      let worker = Worker::new(
        device.destination.clone(),
        connector.clone(),
        params,
        config.modbus.termination_timeout,
      );

      let mut batches = batch_spans(
        BlockKind::Registers,
        device.registers.iter().cloned(),
        config.modbus.batch_threshold,
      );
      if let Some(coils) = &device.coils {
        batches.extend(batch_spans(
          BlockKind::Coils,
          coils.iter().cloned(),
          config.modbus.batch_threshold,
        ));
      }
      let spans = batches
        .iter()
        .map(|batch| (batch.kind, batch.simple()))
        .collect::<Vec<_>>();

      tracing::debug!(
        "Device {} reads {} points in {} requests",
        device.id,
        batches.iter().map(|batch| batch.spans.len()).sum::<usize>(),
        spans.len()
      );

      ids.push(device.id.clone());
      devices.insert(
        device.id.clone(),
        Device {
          config: device.clone(),
          worker,
          batches: Arc::new(batches),
          spans: Arc::new(spans),
        },
      );
    }

    Self {
      devices: Arc::new(devices),
      ids: Arc::new(ids),
    }
  }

  /// Configured device ids in configuration order.
  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.ids.iter().map(String::as_str)
  }

  pub fn device(&self, id: &str) -> Option<&config::Device> {
    self.devices.get(id).map(|device| &device.config)
  }

  pub fn status(&self, id: &str) -> Option<DeviceStatus> {
    self.devices.get(id).map(|device| device.worker.status())
  }

  pub fn statuses(&self) -> Vec<(String, DeviceStatus)> {
    self
      .ids
      .iter()
      .filter_map(|id| self.status(id).map(|status| (id.clone(), status)))
      .collect()
  }

  /// Reads every point of a device in its precomputed batches.
  ///
  /// All readings of one call share a single timestamp.
  #[tracing::instrument(skip(self))]
  pub async fn acquire(
    &self,
    id: &str,
  ) -> Result<Vec<Reading>, DeviceReadError> {
    let device = match self.devices.get(id) {
      Some(device) => device,
      None => return Err(DeviceReadError::DeviceNotFound(id.to_string())),
    };

    let blocks = match device.worker.read(device.spans.to_vec()).await {
      Ok(blocks) => blocks,
      Err(SendError::Connect(error)) => {
        return Err(DeviceReadError::Connect(error))
      }
      Err(SendError::Read(error)) => return Err(DeviceReadError::Read(error)),
      Err(error) => return Err(DeviceReadError::Worker(error.into())),
    };
    if blocks.len() != device.batches.len() {
      return Err(DeviceReadError::Mismatch);
    }

    let timestamp = chrono::Utc::now();
    let mut readings = Vec::new();
    for (batch, block) in device.batches.iter().zip(blocks.iter()) {
      for point in batch.spans.iter() {
        let (raw, value) = match block {
          Block::Registers(words) => {
            let words = batch
              .slice(point, words)
              .ok_or(DeviceReadError::Mismatch)?;
            let parsing = |error| DeviceReadError::ParsingFailed {
              point: point.name.clone(),
              error,
            };
            let raw = decode_raw(words).map_err(parsing)?;
            let value = decode(words, point).map_err(parsing)?;
            (raw, Value::Number(value))
          }
          Block::Coils(bits) => {
            let bit = batch
              .slice(point, bits)
              .and_then(|bits| bits.first().copied())
              .ok_or(DeviceReadError::Mismatch)?;
            (bit as u32, Value::Bool(decode_coil(bit)))
          }
        };

        readings.push(Reading {
          device: id.to_string(),
          point: point.name.clone(),
          timestamp,
          raw,
          value,
        });
      }
    }

    tracing::trace!("Acquired {} readings", readings.len());

    Ok(readings)
  }

  #[tracing::instrument(skip(self))]
  pub async fn write(
    &self,
    id: &str,
    address: Address,
    payload: Payload,
  ) -> Result<(), DeviceWriteError> {
    let device = match self.devices.get(id) {
      Some(device) => device,
      None => return Err(DeviceWriteError::DeviceNotFound(id.to_string())),
    };

    match device.worker.write(address, payload).await {
      Ok(()) => Ok(()),
      Err(SendError::Connect(error)) => Err(DeviceWriteError::Connect(error)),
      Err(SendError::Write(error)) => Err(DeviceWriteError::Write(error)),
      Err(error) => Err(DeviceWriteError::Worker(error.into())),
    }
  }

  /// Stops every worker and releases its connection.
  pub async fn terminate(&self) {
    let terminations = self.devices.iter().map(|(id, device)| async move {
      if let Err(error) = device.worker.terminate().await {
        // NOTE: error -> trace because this means it already terminated and disconnected
        tracing::trace!("Failed terminating worker of {} {}", id, error)
      }
    });

    futures::future::join_all(terminations).await;
  }
}

#[derive(Clone, Debug)]
struct Device {
  config: config::Device,
  worker: Worker,
  batches: Arc<Vec<Batch<PointDefinition>>>,
  spans: Arc<Vec<(BlockKind, SimpleSpan)>>,
}
