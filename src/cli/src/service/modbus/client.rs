use std::fmt::Debug;

use tokio_modbus::{
  client::{tcp, Context},
  prelude::{Reader, Writer},
  Address, Quantity, Slave,
};

use super::connection::Destination;

/// Protocol operations the engine needs from an open session.
#[async_trait::async_trait]
pub trait Client: Send + Debug {
  async fn read_holding_registers(
    &mut self,
    address: Address,
    quantity: Quantity,
  ) -> std::io::Result<Vec<u16>>;

  async fn read_coils(
    &mut self,
    address: Address,
    quantity: Quantity,
  ) -> std::io::Result<Vec<bool>>;

  async fn write_single_register(
    &mut self,
    address: Address,
    word: u16,
  ) -> std::io::Result<()>;

  async fn write_multiple_registers(
    &mut self,
    address: Address,
    words: &[u16],
  ) -> std::io::Result<()>;

  async fn write_single_coil(
    &mut self,
    address: Address,
    bit: bool,
  ) -> std::io::Result<()>;
}

/// Opens sessions to devices.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + Debug {
  async fn connect(
    &self,
    destination: &Destination,
  ) -> std::io::Result<Box<dyn Client>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait::async_trait]
impl Connector for TcpConnector {
  async fn connect(
    &self,
    destination: &Destination,
  ) -> std::io::Result<Box<dyn Client>> {
    let socket = tokio::net::lookup_host((
      destination.host.as_str(),
      destination.port,
    ))
    .await?
    .next()
    .ok_or_else(|| {
      std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("No address found for {}", destination.host),
      )
    })?;

    let ctx = tcp::connect_slave(socket, Slave(destination.unit)).await?;
    tracing::trace!("Connected to {:?} via {}", destination, socket);

    Ok(Box::new(TcpClient { ctx }))
  }
}

#[derive(Debug)]
struct TcpClient {
  ctx: Context,
}

#[async_trait::async_trait]
impl Client for TcpClient {
  async fn read_holding_registers(
    &mut self,
    address: Address,
    quantity: Quantity,
  ) -> std::io::Result<Vec<u16>> {
    self.ctx.read_holding_registers(address, quantity).await
  }

  async fn read_coils(
    &mut self,
    address: Address,
    quantity: Quantity,
  ) -> std::io::Result<Vec<bool>> {
    self.ctx.read_coils(address, quantity).await
  }

  async fn write_single_register(
    &mut self,
    address: Address,
    word: u16,
  ) -> std::io::Result<()> {
    self.ctx.write_single_register(address, word).await
  }

  async fn write_multiple_registers(
    &mut self,
    address: Address,
    words: &[u16],
  ) -> std::io::Result<()> {
    self.ctx.write_multiple_registers(address, words).await
  }

  async fn write_single_coil(
    &mut self,
    address: Address,
    bit: bool,
  ) -> std::io::Result<()> {
    self.ctx.write_single_coil(address, bit).await
  }
}
