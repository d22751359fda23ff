use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio_modbus::{Address, Quantity};

use crate::config;

use super::client::{Client, Connector};
use super::connection::Destination;

/// Two devices sharing one register map. Only `pump` has coils.
pub(crate) fn values(dir: &std::path::Path) -> config::Values {
  let target = dir.join("scada.db");
  let json = serde_json::json!({
    "poll_interval_seconds": 1,
    "persistence": { "target": target.to_string_lossy() },
    "register_maps": {
      "vfd": [
        { "name": "Freq", "address": 10, "words": 1, "multiplier": 0.1,
          "unit": "Hz" },
        { "name": "Energy", "address": 20, "words": 2, "unit": "kWh" }
      ]
    },
    "coil_maps": {
      "vfd": [{ "name": "Run", "address": 0 }]
    },
    "devices": {
      "pump": { "host": "pump", "register_map": "vfd", "coil_map": "vfd" },
      "fan": { "host": "fan", "register_map": "vfd" }
    }
  });

  let mut values = config::from_json(&json.to_string()).unwrap();
  values.modbus.connect_timeout = chrono::Duration::milliseconds(200);
  values.modbus.request_timeout = chrono::Duration::milliseconds(200);
  values.modbus.termination_timeout = chrono::Duration::milliseconds(1000);
  values.modbus.shutdown_grace = chrono::Duration::milliseconds(500);
  values
}

/// In-memory devices keyed by host.
#[derive(Debug, Default)]
pub(crate) struct MockConnector {
  devices: Mutex<HashMap<String, Arc<MockDevice>>>,
}

impl MockConnector {
  pub(crate) fn device(&self, host: &str) -> Arc<MockDevice> {
    let mut devices = self.devices.lock().unwrap();
    devices
      .entry(host.to_owned())
      .or_insert_with(|| Arc::new(MockDevice::default()))
      .clone()
  }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
  async fn connect(
    &self,
    destination: &Destination,
  ) -> std::io::Result<Box<dyn Client>> {
    let device = self.device(&destination.host);
    device.connects.fetch_add(1, Ordering::SeqCst);
    if device.fail_connect.load(Ordering::SeqCst) {
      return Err(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "refused",
      ));
    }

    Ok(Box::new(MockClient { device }))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteEvent {
  Start(Address),
  End(Address),
}

#[derive(Debug, Default)]
pub(crate) struct MockDevice {
  registers: Mutex<HashMap<Address, u16>>,
  coils: Mutex<HashMap<Address, bool>>,
  writes: Mutex<Vec<WriteEvent>>,
  delay: AtomicU64,
  active: AtomicUsize,
  pub(crate) fail_connect: AtomicBool,
  pub(crate) fail_reads: AtomicBool,
  pub(crate) fail_writes: AtomicBool,
  pub(crate) connects: AtomicUsize,
  pub(crate) reads: AtomicUsize,
  pub(crate) max_active: AtomicUsize,
}

impl MockDevice {
  pub(crate) fn set_register(&self, address: Address, word: u16) {
    self.registers.lock().unwrap().insert(address, word);
  }

  pub(crate) fn register(&self, address: Address) -> u16 {
    *self.registers.lock().unwrap().get(&address).unwrap_or(&0)
  }

  pub(crate) fn set_coil(&self, address: Address, bit: bool) {
    self.coils.lock().unwrap().insert(address, bit);
  }

  pub(crate) fn coil(&self, address: Address) -> bool {
    *self.coils.lock().unwrap().get(&address).unwrap_or(&false)
  }

  pub(crate) fn set_delay(&self, delay: std::time::Duration) {
    self.delay.store(delay.as_millis() as u64, Ordering::SeqCst);
  }

  pub(crate) fn writes(&self) -> Vec<WriteEvent> {
    self.writes.lock().unwrap().clone()
  }

  async fn exchange(&self) -> std::io::Result<()> {
    let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_active.fetch_max(active, Ordering::SeqCst);
    let delay = self.delay.load(Ordering::SeqCst);
    if delay > 0 {
      tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }
    self.active.fetch_sub(1, Ordering::SeqCst);
    Ok(())
  }
}

#[derive(Debug)]
struct MockClient {
  device: Arc<MockDevice>,
}

fn broken(message: &str) -> std::io::Error {
  std::io::Error::new(std::io::ErrorKind::BrokenPipe, message.to_owned())
}

#[async_trait::async_trait]
impl Client for MockClient {
  async fn read_holding_registers(
    &mut self,
    address: Address,
    quantity: Quantity,
  ) -> std::io::Result<Vec<u16>> {
    self.device.reads.fetch_add(1, Ordering::SeqCst);
    self.device.exchange().await?;
    if self.device.fail_reads.load(Ordering::SeqCst) {
      return Err(broken("read failed"));
    }

    Ok(
      (address..address + quantity)
        .map(|address| self.device.register(address))
        .collect(),
    )
  }

  async fn read_coils(
    &mut self,
    address: Address,
    quantity: Quantity,
  ) -> std::io::Result<Vec<bool>> {
    self.device.reads.fetch_add(1, Ordering::SeqCst);
    self.device.exchange().await?;
    if self.device.fail_reads.load(Ordering::SeqCst) {
      return Err(broken("read failed"));
    }

    Ok(
      (address..address + quantity)
        .map(|address| self.device.coil(address))
        .collect(),
    )
  }

  async fn write_single_register(
    &mut self,
    address: Address,
    word: u16,
  ) -> std::io::Result<()> {
    self.write_multiple_registers(address, &[word]).await
  }

  async fn write_multiple_registers(
    &mut self,
    address: Address,
    words: &[u16],
  ) -> std::io::Result<()> {
    self.device.writes.lock().unwrap().push(WriteEvent::Start(address));
    self.device.exchange().await?;
    if self.device.fail_writes.load(Ordering::SeqCst) {
      return Err(broken("write rejected"));
    }
    for (offset, word) in words.iter().enumerate() {
      self.device.set_register(address + offset as Address, *word);
    }
    self.device.writes.lock().unwrap().push(WriteEvent::End(address));
    Ok(())
  }

  async fn write_single_coil(
    &mut self,
    address: Address,
    bit: bool,
  ) -> std::io::Result<()> {
    self.device.writes.lock().unwrap().push(WriteEvent::Start(address));
    self.device.exchange().await?;
    if self.device.fail_writes.load(Ordering::SeqCst) {
      return Err(broken("write rejected"));
    }
    self.device.set_coil(address, bit);
    self.device.writes.lock().unwrap().push(WriteEvent::End(address));
    Ok(())
  }
}
