use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Modbus {
  pub(crate) request_timeout: Option<u32>,
  pub(crate) connect_timeout: Option<u32>,
  pub(crate) batch_threshold: Option<u16>,
  pub(crate) termination_timeout: Option<u32>,
  pub(crate) shutdown_grace: Option<u32>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Persistence {
  pub(crate) target: Option<String>,
  pub(crate) batch_size: Option<usize>,
  pub(crate) flush_interval: Option<u32>,
  pub(crate) channel_capacity: Option<usize>,
  pub(crate) append_timeout: Option<u32>,
  pub(crate) query_page_size: Option<u32>,
  pub(crate) csv_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Register {
  pub(crate) name: String,
  pub(crate) address: u16,
  pub(crate) words: u8,
  pub(crate) multiplier: Option<Decimal>,
  #[serde(default)]
  pub(crate) unit: String,
  pub(crate) description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Coil {
  pub(crate) name: String,
  pub(crate) address: u16,
  #[serde(default)]
  pub(crate) unit: String,
  pub(crate) description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Device {
  pub(crate) host: String,
  pub(crate) port: Option<u16>,
  pub(crate) unit_id: Option<u8>,
  pub(crate) register_map: String,
  pub(crate) coil_map: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Values {
  pub(crate) log_level: Option<LogLevel>,
  pub(crate) poll_interval_seconds: Option<u32>,
  #[serde(default)]
  pub(crate) modbus: Modbus,
  #[serde(default)]
  pub(crate) persistence: Persistence,
  #[serde(default)]
  pub(crate) register_maps: HashMap<String, Vec<Register>>,
  #[serde(default)]
  pub(crate) coil_maps: HashMap<String, Vec<Coil>>,
  #[serde(default)]
  pub(crate) devices: HashMap<String, Device>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
  #[error("Failed creating project directories")]
  MissingProjectDirs,

  #[error("Failed reading config file")]
  Read(#[from] std::io::Error),

  #[error("Config file is missing an extension")]
  MissingExtension,

  #[error("Config file has invalid extension")]
  InvalidExtension,

  #[error("Failed deserializing config from yaml")]
  DeserializationYaml(#[from] serde_yaml::Error),

  #[error("Failed deserializing config from toml")]
  DeserializationToml(#[from] toml::de::Error),

  #[error("Failed deserializing config from json")]
  DeserializationJson(#[from] serde_json::Error),
}

pub(crate) async fn parse_file(
  location: Option<&str>,
) -> Result<Values, ParseError> {
  let location = match location {
    Some(location) => std::path::PathBuf::from(location),
    None => {
      match directories::ProjectDirs::from("com", "scadapoll", "scadapoll") {
        Some(project_dirs) => project_dirs.config_dir().join("config.yaml"),
        None => return Err(ParseError::MissingProjectDirs),
      }
    }
  };

  let values = {
    let raw = tokio::fs::read_to_string(location.clone()).await?;
    match location.extension().and_then(|str| str.to_str()) {
      None => return Err(ParseError::MissingExtension),
      Some("yaml" | "yml") => serde_yaml::from_str::<Values>(raw.as_str())?,
      Some("toml") => toml::from_str::<Values>(raw.as_str())?,
      Some("json") => serde_json::from_str::<Values>(raw.as_str())?,
      Some(_) => return Err(ParseError::InvalidExtension),
    }
  };

  Ok(values)
}

pub(crate) fn parse_json(json: &str) -> Result<Values, ParseError> {
  let parsed = serde_json::from_str::<Values>(json)?;

  Ok(parsed)
}

pub(crate) fn milliseconds_to_chrono(milliseconds: u32) -> chrono::Duration {
  chrono::Duration::milliseconds(milliseconds as i64)
}
