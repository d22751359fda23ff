mod args;
mod env;
mod file;

use std::{collections::HashMap, sync::Arc};

use rust_decimal::Decimal;
use thiserror::Error;

use crate::service::modbus::{
  self, BlockKind, MapError, NumericPointKind, PointDefinition, PointKind,
  PointMap,
};

#[derive(Debug, Clone)]
pub struct Modbus {
  pub request_timeout: chrono::Duration,
  pub connect_timeout: chrono::Duration,
  pub batch_threshold: u16,
  pub termination_timeout: chrono::Duration,
  pub shutdown_grace: chrono::Duration,
}

#[derive(Debug, Clone)]
pub struct Persistence {
  pub target: String,
  pub batch_size: usize,
  pub flush_interval: chrono::Duration,
  pub channel_capacity: usize,
  pub append_timeout: chrono::Duration,
  pub query_page_size: u32,
  pub csv_dir: Option<String>,
}

/// A configured device with its maps resolved.
#[derive(Debug, Clone)]
pub struct Device {
  pub id: String,
  pub destination: modbus::Destination,
  pub registers: Arc<PointMap>,
  pub coils: Option<Arc<PointMap>>,
}

#[derive(Debug, Clone)]
pub struct Values {
  pub log_level: tracing::level_filters::LevelFilter,
  pub poll_interval: chrono::Duration,
  pub modbus: Modbus,
  pub persistence: Persistence,
  pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Default)]
struct Unparsed {
  from_args: args::Values,
  from_env: env::Values,
  from_file: file::Values,
}

#[derive(Debug, Error)]
pub enum ReadError {
  #[error("Failed reading file")]
  FileReadError(#[from] file::ParseError),

  #[error("Failed reading env")]
  EnvReadError(#[from] env::ParseError),

  #[error("Invalid map {name:?}")]
  Map {
    name: String,
    #[source]
    error: MapError,
  },

  #[error("Point {point:?} in map {map:?} has {words} words")]
  Words { map: String, point: String, words: u8 },

  #[error(
    "Point {point:?} in map {map:?} needs a positive multiplier that can \
     scale every raw value"
  )]
  Multiplier { map: String, point: String },

  #[error(
    "Device {device:?} has register and coil points both named {point:?}"
  )]
  PointCollision { device: String, point: String },

  #[error(
    "Device id {0:?} may only use letters, digits, '-', '_' and '.' and \
     must not start with '.'"
  )]
  DeviceId(String),

  #[error("Device {device:?} references unknown register map {map:?}")]
  UnknownRegisterMap { device: String, map: String },

  #[error("Device {device:?} references unknown coil map {map:?}")]
  UnknownCoilMap { device: String, map: String },

  #[error("Device {0:?} has no host")]
  EmptyHost(String),

  #[error("Poll interval must be at least one second")]
  PollInterval,
}

/// Reads args, env and the config file once.
pub async fn load() -> Result<Values, ReadError> {
  let from_args = args::parse();
  let from_env = env::parse()?;
  let from_file = file::parse_file(from_args.config.as_deref()).await?;

  parse(Unparsed {
    from_args,
    from_env,
    from_file,
  })
}

/// Builds values from a JSON document alone.
pub fn from_json(json: &str) -> Result<Values, ReadError> {
  parse(Unparsed {
    from_file: file::parse_json(json)?,
    ..Default::default()
  })
}

fn parse(config: Unparsed) -> Result<Values, ReadError> {
  let Unparsed {
    from_args,
    from_env,
    from_file,
  } = config;

  let log_level = if from_args.trace {
    tracing::level_filters::LevelFilter::TRACE
  } else {
    from_file.log_level.map_or_else(
      || {
        #[cfg(debug_assertions)]
        {
          tracing::level_filters::LevelFilter::DEBUG
        }
        #[cfg(not(debug_assertions))]
        {
          tracing::level_filters::LevelFilter::INFO
        }
      },
      |log_level| match log_level {
        file::LogLevel::Trace => tracing::level_filters::LevelFilter::TRACE,
        file::LogLevel::Debug => tracing::level_filters::LevelFilter::DEBUG,
        file::LogLevel::Info => tracing::level_filters::LevelFilter::INFO,
        file::LogLevel::Warn => tracing::level_filters::LevelFilter::WARN,
        file::LogLevel::Error => tracing::level_filters::LevelFilter::ERROR,
      },
    )
  };

  let poll_interval_seconds = from_file.poll_interval_seconds.unwrap_or(5);
  if poll_interval_seconds == 0 {
    return Err(ReadError::PollInterval);
  }

  let register_maps = from_file
    .register_maps
    .into_iter()
    .map(|(name, registers)| {
      let map = to_register_map(&name, registers)?;
      Ok((name, Arc::new(map)))
    })
    .collect::<Result<HashMap<_, _>, ReadError>>()?;

  let coil_maps = from_file
    .coil_maps
    .into_iter()
    .map(|(name, coils)| {
      let map = to_coil_map(&name, coils)?;
      Ok((name, Arc::new(map)))
    })
    .collect::<Result<HashMap<_, _>, ReadError>>()?;

  let mut devices = from_file
    .devices
    .into_iter()
    .map(|(id, device)| {
      to_device(id, device, &register_maps, &coil_maps)
    })
    .collect::<Result<Vec<_>, ReadError>>()?;
  devices.sort_by(|lhs, rhs| lhs.id.cmp(&rhs.id));

  let persistence = from_file.persistence;
  let modbus = from_file.modbus;

  Ok(Values {
    log_level,
    poll_interval: chrono::Duration::seconds(poll_interval_seconds as i64),
    modbus: Modbus {
      request_timeout: file::milliseconds_to_chrono(
        modbus.request_timeout.unwrap_or(1500),
      ),
      connect_timeout: file::milliseconds_to_chrono(
        modbus.connect_timeout.unwrap_or(3000),
      ),
      batch_threshold: modbus.batch_threshold.unwrap_or(3),
      termination_timeout: file::milliseconds_to_chrono(
        modbus.termination_timeout.unwrap_or(10_000),
      ),
      shutdown_grace: file::milliseconds_to_chrono(
        modbus.shutdown_grace.unwrap_or(5_000),
      ),
    },
    persistence: Persistence {
      target: from_env
        .persistence_target
        .or(persistence.target)
        .unwrap_or_else(|| "data/scada.db".to_owned()),
      batch_size: persistence.batch_size.unwrap_or(256).max(1),
      flush_interval: file::milliseconds_to_chrono(
        persistence.flush_interval.unwrap_or(2000).max(1),
      ),
      channel_capacity: persistence.channel_capacity.unwrap_or(4096).max(1),
      append_timeout: file::milliseconds_to_chrono(
        persistence.append_timeout.unwrap_or(100),
      ),
      query_page_size: persistence.query_page_size.unwrap_or(512).max(1),
      csv_dir: from_env.csv_dir.or(persistence.csv_dir),
    },
    devices,
  })
}

fn to_register_map(
  name: &str,
  registers: Vec<file::Register>,
) -> Result<PointMap, ReadError> {
  let points = registers
    .into_iter()
    .map(|register| {
      let multiplier = register.multiplier.unwrap_or(Decimal::ONE);
      let scalable = Decimal::from(u32::MAX).checked_mul(multiplier).is_some();
      if multiplier <= Decimal::ZERO || !scalable {
        return Err(ReadError::Multiplier {
          map: name.to_owned(),
          point: register.name,
        });
      }

      let kind = NumericPointKind { multiplier };
      let kind = match register.words {
        1 => PointKind::U16(kind),
        2 => PointKind::U32(kind),
        words => {
          return Err(ReadError::Words {
            map: name.to_owned(),
            point: register.name,
            words,
          })
        }
      };

      Ok(PointDefinition {
        name: register.name,
        address: register.address,
        kind,
        unit: register.unit,
        description: register.description,
      })
    })
    .collect::<Result<Vec<_>, ReadError>>()?;

  PointMap::new(name, BlockKind::Registers, points).map_err(|error| {
    ReadError::Map {
      name: name.to_owned(),
      error,
    }
  })
}

fn to_coil_map(
  name: &str,
  coils: Vec<file::Coil>,
) -> Result<PointMap, ReadError> {
  let points = coils
    .into_iter()
    .map(|coil| PointDefinition {
      name: coil.name,
      address: coil.address,
      kind: PointKind::Coil,
      unit: coil.unit,
      description: coil.description,
    })
    .collect();

  PointMap::new(name, BlockKind::Coils, points).map_err(|error| {
    ReadError::Map {
      name: name.to_owned(),
      error,
    }
  })
}

fn to_device(
  id: String,
  device: file::Device,
  register_maps: &HashMap<String, Arc<PointMap>>,
  coil_maps: &HashMap<String, Arc<PointMap>>,
) -> Result<Device, ReadError> {
  // NOTE: ids name the csv mirror files so they must be usable as is
  let valid_id = !id.is_empty()
    && !id.starts_with('.')
    && id
      .chars()
      .all(|char| char.is_ascii_alphanumeric() || "-_.".contains(char));
  if !valid_id {
    return Err(ReadError::DeviceId(id));
  }

  if device.host.trim().is_empty() {
    return Err(ReadError::EmptyHost(id));
  }

  let registers = match register_maps.get(&device.register_map) {
    Some(map) => map.clone(),
    None => {
      return Err(ReadError::UnknownRegisterMap {
        device: id,
        map: device.register_map,
      })
    }
  };

  let coils = match device.coil_map {
    Some(name) => match coil_maps.get(&name) {
      Some(map) => Some(map.clone()),
      None => {
        return Err(ReadError::UnknownCoilMap {
          device: id,
          map: name,
        })
      }
    },
    None => None,
  };

  if let Some(coils) = &coils {
    if let Some(point) = coils
      .iter()
      .find(|coil| registers.get(&coil.name).is_some())
    {
      return Err(ReadError::PointCollision {
        device: id,
        point: point.name.clone(),
      });
    }
  }

  Ok(Device {
    destination: modbus::Destination {
      host: device.host,
      port: device.port.unwrap_or(502),
      unit: device.unit_id.unwrap_or(1),
    },
    id,
    registers,
    coils,
  })
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use rust_decimal_macros::dec;

  use super::*;

  const CONFIG: &str = r#"{
    "poll_interval_seconds": 2,
    "persistence": { "target": "plant.db", "batch_size": 10 },
    "register_maps": {
      "vfd": [
        { "name": "Freq", "address": 10, "words": 1, "multiplier": 0.1,
          "unit": "Hz" },
        { "name": "Energy", "address": 20, "words": 2, "unit": "kWh",
          "description": "Total energy" }
      ]
    },
    "coil_maps": {
      "vfd": [{ "name": "Run", "address": 0 }]
    },
    "devices": {
      "pump": { "host": "10.0.0.2", "register_map": "vfd",
                "coil_map": "vfd" },
      "fan": { "host": "10.0.0.3", "port": 5020, "unit_id": 7,
               "register_map": "vfd" }
    }
  }"#;

  #[test]
  fn resolves_maps_and_defaults() {
    let values = from_json(CONFIG).unwrap();

    assert_eq!(values.poll_interval, chrono::Duration::seconds(2));
    assert_eq!(values.persistence.target, "plant.db");
    assert_eq!(values.persistence.batch_size, 10);
    assert_eq!(values.persistence.flush_interval.num_milliseconds(), 2000);
    assert_eq!(values.modbus.request_timeout.num_milliseconds(), 1500);

    let ids = values
      .devices
      .iter()
      .map(|device| device.id.as_str())
      .collect::<Vec<_>>();
    assert_eq!(ids, vec!["fan", "pump"]);

    let fan = &values.devices[0];
    assert_eq!(
      fan.destination,
      modbus::Destination {
        host: "10.0.0.3".to_owned(),
        port: 5020,
        unit: 7,
      }
    );
    assert!(fan.coils.is_none());

    let pump = &values.devices[1];
    assert_eq!(pump.destination.port, 502);
    assert_eq!(pump.destination.unit, 1);
    assert!(Arc::ptr_eq(&fan.registers, &pump.registers));
    assert_eq!(
      pump.registers.get("Freq").map(|point| point.kind),
      Some(PointKind::U16(NumericPointKind {
        multiplier: dec!(0.1)
      }))
    );
    assert_eq!(
      pump.registers.get("Energy").map(|point| point.kind),
      Some(PointKind::U32(NumericPointKind {
        multiplier: dec!(1)
      }))
    );
  }

  #[test]
  fn rejects_unknown_maps() {
    let error = from_json(
      r#"{ "devices": { "pump": { "host": "a", "register_map": "nope" } } }"#,
    )
    .unwrap_err();

    assert!(matches!(error, ReadError::UnknownRegisterMap { .. }));
  }

  #[test]
  fn rejects_invalid_points() {
    let words = from_json(
      r#"{ "register_maps": { "m": [
        { "name": "X", "address": 1, "words": 3 }
      ] } }"#,
    )
    .unwrap_err();
    assert!(matches!(words, ReadError::Words { words: 3, .. }));

    let multiplier = from_json(
      r#"{ "register_maps": { "m": [
        { "name": "X", "address": 1, "words": 1, "multiplier": 0 }
      ] } }"#,
    )
    .unwrap_err();
    assert!(matches!(multiplier, ReadError::Multiplier { .. }));

    let duplicate = from_json(
      r#"{ "register_maps": { "m": [
        { "name": "X", "address": 1, "words": 1 },
        { "name": "Y", "address": 1, "words": 1 }
      ] } }"#,
    )
    .unwrap_err();
    assert!(matches!(
      duplicate,
      ReadError::Map {
        error: MapError::DuplicateAddress { .. },
        ..
      }
    ));
  }

  #[test]
  fn rejects_empty_hosts_and_zero_intervals() {
    let host = from_json(
      r#"{
        "register_maps": { "m": [] },
        "devices": { "pump": { "host": " ", "register_map": "m" } }
      }"#,
    )
    .unwrap_err();
    assert!(matches!(host, ReadError::EmptyHost(_)));

    let interval = from_json(r#"{ "poll_interval_seconds": 0 }"#).unwrap_err();
    assert!(matches!(interval, ReadError::PollInterval));
  }

  #[test]
  fn rejects_huge_multipliers() {
    let error = from_json(
      r#"{ "register_maps": { "m": [
        { "name": "X", "address": 1, "words": 2,
          "multiplier": 10000000000000000000000 }
      ] } }"#,
    )
    .unwrap_err();

    assert!(matches!(error, ReadError::Multiplier { .. }));
  }

  #[test]
  fn rejects_points_named_in_both_maps() {
    let error = from_json(
      r#"{
        "register_maps": { "m": [
          { "name": "Run", "address": 10, "words": 1 }
        ] },
        "coil_maps": { "c": [{ "name": "Run", "address": 0 }] },
        "devices": {
          "pump": { "host": "a", "register_map": "m", "coil_map": "c" }
        }
      }"#,
    )
    .unwrap_err();

    match error {
      ReadError::PointCollision { device, point } => {
        assert_eq!((device.as_str(), point.as_str()), ("pump", "Run"))
      }
      other => panic!("unexpected error {other:?}"),
    }
  }

  #[test]
  fn rejects_device_ids_unfit_for_file_names() {
    for id in ["fan/1", "...", "../pump", ""] {
      let json = serde_json::json!({
        "register_maps": { "m": [] },
        "devices": { id: { "host": "a", "register_map": "m" } }
      });

      let error = from_json(&json.to_string()).unwrap_err();
      assert!(matches!(error, ReadError::DeviceId(_)), "accepted {id:?}");
    }

    let json = serde_json::json!({
      "register_maps": { "m": [] },
      "devices": { "fan_1.north-2": { "host": "a", "register_map": "m" } }
    });
    assert!(from_json(&json.to_string()).is_ok());
  }
}
