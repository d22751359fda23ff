use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::cache;
use super::modbus::{
  self, encoding, DeviceWriteError, EncodingError, Payload, PointDefinition,
  PointKind, Reading, Value,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
  pub device: String,
  pub point: String,
  pub value: WriteValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WriteValue {
  Bool(bool),
  Number(Decimal),
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
  #[error("Coil {point:?} takes true, false, 0 or 1")]
  ExpectedBool { point: String },

  #[error("Register {point:?} takes a number")]
  ExpectedNumber { point: String },

  #[error("Value does not fit register {point:?}")]
  Encoding {
    point: String,
    #[source]
    error: EncodingError,
  },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
  #[error("No device with id {0:?}")]
  UnknownDevice(String),

  #[error("Device {device:?} has no point {point:?}")]
  UnknownPoint { device: String, point: String },

  #[error("Invalid value")]
  Validation(#[from] ValidationError),

  #[error("Write failed")]
  Write(#[source] DeviceWriteError),

  #[error("Device worker is gone")]
  WorkerGone(anyhow::Error),
}

pub type WriteResult = Result<Reading, CommandError>;

/// Performs requested writes through the device workers.
///
/// Writes to one device queue behind each other and behind that device's
/// poll reads. Nothing is retried.
#[derive(Debug, Clone)]
pub struct Service {
  modbus: modbus::Service,
  cache: cache::Service,
}

impl Service {
  pub(crate) fn new(modbus: modbus::Service, cache: cache::Service) -> Self {
    Self { modbus, cache }
  }

  /// Validates, writes and on success caches the written value.
  ///
  /// The cached reading is optimistic until the next poll of the device.
  #[tracing::instrument(skip(self), fields(
    device = %request.device,
    point = %request.point
  ))]
  pub async fn execute(&self, request: WriteRequest) -> WriteResult {
    let device = match self.modbus.device(&request.device) {
      Some(device) => device,
      None => return Err(CommandError::UnknownDevice(request.device)),
    };

    let point = device
      .registers
      .get(&request.point)
      .or_else(|| {
        device
          .coils
          .as_ref()
          .and_then(|coils| coils.get(&request.point))
      })
      .cloned();
    let point = match point {
      Some(point) => point,
      None => {
        return Err(CommandError::UnknownPoint {
          device: request.device,
          point: request.point,
        })
      }
    };

    let (payload, raw, value) = validate(&point, request.value)?;

    if let Err(error) =
      self.modbus.write(&request.device, point.address, payload).await
    {
      tracing::warn! {
        %error,
        "Write failed"
      };

      return Err(match error {
        DeviceWriteError::DeviceNotFound(id) => CommandError::UnknownDevice(id),
        DeviceWriteError::Worker(error) => CommandError::WorkerGone(error),
        error => CommandError::Write(error),
      });
    }

    let reading = Reading {
      device: request.device,
      point: request.point,
      timestamp: chrono::Utc::now(),
      raw,
      value,
    };
    self.cache.put(reading.clone());

    tracing::info!("Wrote {}", reading.value);

    Ok(reading)
  }
}

fn validate(
  point: &PointDefinition,
  value: WriteValue,
) -> Result<(Payload, u32, Value), ValidationError> {
  match point.kind {
    PointKind::Coil => {
      let bit = match value {
        WriteValue::Bool(bit) => bit,
        WriteValue::Number(number) if number == Decimal::ZERO => false,
        WriteValue::Number(number) if number == Decimal::ONE => true,
        WriteValue::Number(_) => {
          return Err(ValidationError::ExpectedBool {
            point: point.name.clone(),
          })
        }
      };

      Ok((Payload::Coil(bit), bit as u32, Value::Bool(bit)))
    }
    PointKind::U16(_) | PointKind::U32(_) => {
      let number = match value {
        WriteValue::Number(number) => number,
        WriteValue::Bool(_) => {
          return Err(ValidationError::ExpectedNumber {
            point: point.name.clone(),
          })
        }
      };

      let encoding = |error| ValidationError::Encoding {
        point: point.name.clone(),
        error,
      };
      let words = encoding::encode(number, point).map_err(encoding)?;
      let raw = encoding::decode_raw(&words).map_err(encoding)?;
      let scaled = encoding::decode(&words, point).map_err(encoding)?;

      Ok((Payload::Registers(words), raw, Value::Number(scaled)))
    }
  }
}
