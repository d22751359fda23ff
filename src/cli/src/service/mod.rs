pub mod cache;
pub mod command;
pub mod db;
mod export;
pub mod modbus;
pub mod sink;

use std::sync::Arc;

use crate::*;

pub trait Service {
  fn new(config: &config::Values) -> Self;
}

/// Every long-lived service, built once from the loaded configuration.
///
/// Cheap to clone. The presentation layer reaches the engine only through
/// `cache`, `sink`, `command` and the status and metadata accessors.
#[derive(Debug, Clone)]
pub struct Container {
  modbus: modbus::Service,
  cache: cache::Service,
  db: db::Service,
  sink: sink::Service,
  command: command::Service,
  target: String,
}

impl Container {
  /// Must be called from within a tokio runtime.
  pub fn new(config: &config::Values) -> Self {
    Self::with_connector(config, Arc::new(modbus::TcpConnector))
  }

  pub fn with_connector(
    config: &config::Values,
    connector: Arc<dyn modbus::Connector>,
  ) -> Self {
    let modbus = modbus::Service::new(config, connector);
    let cache = cache::Service::new(config);
    let db = db::Service::new(config);
    let export = export::Service::new(config);
    let sink = sink::Service::new(config, db.clone(), export);
    let command = command::Service::new(modbus.clone(), cache.clone());

    Self {
      modbus,
      cache,
      db,
      sink,
      command,
      target: config.persistence.target.clone(),
    }
  }

  pub fn cache(&self) -> &cache::Service {
    &self.cache
  }

  pub fn sink(&self) -> &sink::Service {
    &self.sink
  }

  pub fn command(&self) -> &command::Service {
    &self.command
  }

  pub(crate) fn modbus(&self) -> &modbus::Service {
    &self.modbus
  }

  pub fn device_status(&self, id: &str) -> Option<modbus::DeviceStatus> {
    self.modbus.status(id)
  }

  /// Statuses of every configured device in configuration order.
  pub fn device_statuses(&self) -> Vec<(String, modbus::DeviceStatus)> {
    self.modbus.statuses()
  }

  /// Register points first, then coils, each in map order.
  pub fn points(&self, id: &str) -> Option<Vec<modbus::PointDefinition>> {
    let device = self.modbus.device(id)?;
    let registers = device.registers.iter();
    let coils = device.coils.iter().flat_map(|coils| coils.iter());

    Some(registers.chain(coils).cloned().collect())
  }

  pub async fn migrate(&self) -> Result<(), db::MigrateError> {
    self.db.migrate(&self.target).await
  }

  /// Releases every device connection, then drains the sink.
  ///
  /// Call after the poll process has stopped.
  pub async fn shutdown(&self) {
    self.modbus.terminate().await;

    if let Err(error) = self.sink.terminate().await {
      tracing::warn! {
        %error,
        "Failed terminating sink"
      }
    }
  }
}
