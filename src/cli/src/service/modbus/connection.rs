use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_time::future::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio_modbus::Address;

use super::client::{Client, Connector};
use super::span::{BlockKind, SimpleSpan};

#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize)]
pub struct Destination {
  pub host: String,
  pub port: u16,
  pub unit: u8,
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize)]
pub enum ConnectionState {
  Disconnected,
  Connected,
  Error,
}

/// Runtime state of a device, owned by its connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
  pub state: ConnectionState,
  pub last_success_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

impl Default for DeviceStatus {
  fn default() -> Self {
    Self {
      state: ConnectionState::Disconnected,
      last_success_at: None,
      last_error: None,
    }
  }
}

#[derive(Copy, Clone, Debug)]
pub struct Params {
  connect_timeout: futures_time::time::Duration,
  request_timeout: futures_time::time::Duration,
}

impl Params {
  pub fn new(
    connect_timeout: chrono::Duration,
    request_timeout: chrono::Duration,
  ) -> Self {
    Self {
      connect_timeout: timeout_from_chrono(connect_timeout),
      request_timeout: timeout_from_chrono(request_timeout),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Block {
  Registers(Vec<u16>),
  Coils(Vec<bool>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
  Registers(Vec<u16>),
  Coil(bool),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
  #[error("Failed to connect")]
  Connect(#[from] std::io::Error),

  #[error("Connecting timed out")]
  Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
  #[error("No open session")]
  NotConnected,

  #[error("Request timed out")]
  Timeout,

  #[error("Transport failure")]
  Transport(#[from] std::io::Error),

  #[error("Expected {expected} values but got {actual}")]
  Malformed { expected: usize, actual: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
  #[error("No open session")]
  NotConnected,

  #[error("Request timed out")]
  Timeout,

  #[error("Write failed or was rejected by the device")]
  Transport(#[from] std::io::Error),

  #[error("Nothing to write")]
  Empty,
}

/// The one session to a device.
///
/// Any failed exchange drops the session so that the next operation
/// reconnects instead of retrying in place.
#[derive(Debug)]
pub struct Connection {
  destination: Destination,
  connector: Arc<dyn Connector>,
  params: Params,
  client: Option<Box<dyn Client>>,
  status: watch::Sender<DeviceStatus>,
}

impl Connection {
  pub fn new(
    destination: Destination,
    connector: Arc<dyn Connector>,
    params: Params,
    status: watch::Sender<DeviceStatus>,
  ) -> Self {
    Self {
      destination,
      connector,
      params,
      client: None,
      status,
    }
  }

  pub fn destination(&self) -> &Destination {
    &self.destination
  }

  pub fn is_connected(&self) -> bool {
    self.client.is_some()
  }

  #[tracing::instrument(skip(self), fields(destination = ?self.destination))]
  pub async fn connect(&mut self) -> Result<(), ConnectError> {
    if self.client.is_some() {
      return Ok(());
    }

    let result = match self
      .connector
      .connect(&self.destination)
      .timeout(self.params.connect_timeout)
      .await
    {
      Ok(Ok(client)) => Ok(client),
      Ok(Err(error)) => Err(ConnectError::Connect(error)),
      Err(_) => Err(ConnectError::Timeout),
    };

    match result {
      Ok(client) => {
        self.client = Some(client);
        tracing::trace!("Connected");
        Ok(())
      }
      Err(error) => {
        self.fail(&error);
        Err(error)
      }
    }
  }

  #[tracing::instrument(skip(self), fields(destination = ?self.destination))]
  pub async fn read_block(
    &mut self,
    kind: BlockKind,
    span: SimpleSpan,
  ) -> Result<Block, ReadError> {
    let timeout = self.params.request_timeout;
    let client = match self.client.as_mut() {
      Some(client) => client,
      None => return Err(ReadError::NotConnected),
    };

    let expected = span.quantity as usize;
    let result = match kind {
      BlockKind::Registers => {
        match client
          .read_holding_registers(span.address, span.quantity)
          .timeout(timeout)
          .await
        {
          Ok(Ok(words)) if words.len() == expected => {
            Ok(Block::Registers(words))
          }
          Ok(Ok(words)) => Err(ReadError::Malformed {
            expected,
            actual: words.len(),
          }),
          Ok(Err(error)) => Err(ReadError::Transport(error)),
          Err(_) => Err(ReadError::Timeout),
        }
      }
      BlockKind::Coils => {
        match client
          .read_coils(span.address, span.quantity)
          .timeout(timeout)
          .await
        {
          // NOTE: coil responses are packed into bytes so trailing padding
          // bits may come back
          Ok(Ok(mut bits)) if bits.len() >= expected => {
            bits.truncate(expected);
            Ok(Block::Coils(bits))
          }
          Ok(Ok(bits)) => Err(ReadError::Malformed {
            expected,
            actual: bits.len(),
          }),
          Ok(Err(error)) => Err(ReadError::Transport(error)),
          Err(_) => Err(ReadError::Timeout),
        }
      }
    };

    match result {
      Ok(block) => {
        self.succeed();
        Ok(block)
      }
      Err(error) => {
        self.fail(&error);
        Err(error)
      }
    }
  }

  #[tracing::instrument(skip(self), fields(destination = ?self.destination))]
  pub async fn write_point(
    &mut self,
    address: Address,
    payload: Payload,
  ) -> Result<(), WriteError> {
    let timeout = self.params.request_timeout;
    let client = match self.client.as_mut() {
      Some(client) => client,
      None => return Err(WriteError::NotConnected),
    };

    let result = match payload {
      Payload::Coil(bit) => {
        client.write_single_coil(address, bit).timeout(timeout).await
      }
      Payload::Registers(words) => match words.as_slice() {
        [] => return Err(WriteError::Empty),
        [word] => {
          client
            .write_single_register(address, *word)
            .timeout(timeout)
            .await
        }
        words => {
          client
            .write_multiple_registers(address, words)
            .timeout(timeout)
            .await
        }
      },
    };

    let result = match result {
      Ok(Ok(())) => Ok(()),
      Ok(Err(error)) => Err(WriteError::Transport(error)),
      Err(_) => Err(WriteError::Timeout),
    };

    match result {
      Ok(()) => {
        self.succeed();
        Ok(())
      }
      Err(error) => {
        self.fail(&error);
        Err(error)
      }
    }
  }

  /// Drops the session. A connected device reports as disconnected after.
  pub fn disconnect(&mut self) {
    if self.client.take().is_some() {
      self.status.send_modify(|status| {
        if status.state == ConnectionState::Connected {
          status.state = ConnectionState::Disconnected;
        }
      });
    }
  }

  fn succeed(&mut self) {
    self.status.send_modify(|status| {
      status.state = ConnectionState::Connected;
      status.last_success_at = Some(chrono::Utc::now());
    });
  }

  fn fail(&mut self, error: &(dyn std::error::Error + 'static)) {
    self.client = None;
    let message = error_chain(error);
    self.status.send_modify(|status| {
      status.state = ConnectionState::Error;
      status.last_error = Some(message);
    });
  }
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
  let mut message = error.to_string();
  let mut source = error.source();
  while let Some(inner) = source {
    message.push_str(": ");
    message.push_str(&inner.to_string());
    source = inner.source();
  }
  message
}

fn timeout_from_chrono(
  timeout: chrono::Duration,
) -> futures_time::time::Duration {
  futures_time::time::Duration::from_millis(
    timeout.num_milliseconds().max(0) as u64,
  )
}
