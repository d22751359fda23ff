use std::sync::Arc;

use futures_time::future::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio_modbus::Address;

use super::client::Connector;
use super::connection::*;
use super::span::{BlockKind, SimpleSpan};

/// Handle to the task that exclusively owns one device connection.
///
/// Requests are served strictly one after another so reads from the poll
/// cycle and writes from commands never touch the session concurrently.
#[derive(Debug, Clone)]
pub(crate) struct Worker {
  sender: RequestSender,
  handle: Arc<Mutex<Option<TaskHandle>>>,
  status: watch::Receiver<DeviceStatus>,
  termination_timeout: futures_time::time::Duration,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SendError {
  #[error("Failed to connect")]
  Connect(#[from] ConnectError),

  #[error("Failed to read")]
  Read(#[from] ReadError),

  #[error("Failed to write")]
  Write(#[from] WriteError),

  #[error("Channel was disconnected before the request could be finished")]
  ChannelDisconnected(anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum TerminateError {
  #[error("Channel was disconnected before the request could be finished")]
  ChannelDisconnected(anyhow::Error),

  #[error("Termination timed out")]
  Timeout(anyhow::Error),

  #[error("Failed joining inner handle")]
  Join(anyhow::Error),
}

impl Worker {
  pub(crate) fn new(
    destination: Destination,
    connector: Arc<dyn Connector>,
    params: Params,
    termination_timeout: chrono::Duration,
  ) -> Self {
    let (status_sender, status) = watch::channel(DeviceStatus::default());
    let connection =
      Connection::new(destination, connector, params, status_sender);
    let (sender, receiver) = flume::unbounded();
    let task = Task {
      connection,
      receiver,
    };
    let handle = tokio::spawn(task.execute());
    Self {
      sender,
      handle: Arc::new(Mutex::new(Some(handle))),
      status,
      termination_timeout: futures_time::time::Duration::from_millis(
        termination_timeout.num_milliseconds().max(0) as u64,
      ),
    }
  }

  pub(crate) fn status(&self) -> DeviceStatus {
    self.status.borrow().clone()
  }

  /// Connects if needed and reads every span in order.
  ///
  /// Fails on the first span that could not be read.
  pub(crate) async fn read(
    &self,
    spans: Vec<(BlockKind, SimpleSpan)>,
  ) -> Result<Vec<Block>, SendError> {
    let (sender, receiver) = flume::bounded(1);
    if let Err(error) = self
      .sender
      .send_async(TaskRequest::Read { spans, sender })
      .await
    {
      return Err(SendError::ChannelDisconnected(error.into()));
    };

    match receiver.recv_async().await {
      Ok(response) => response,
      Err(error) => Err(SendError::ChannelDisconnected(error.into())),
    }
  }

  /// Connects if needed and performs a single write. Never retried.
  pub(crate) async fn write(
    &self,
    address: Address,
    payload: Payload,
  ) -> Result<(), SendError> {
    let (sender, receiver) = flume::bounded(1);
    if let Err(error) = self
      .sender
      .send_async(TaskRequest::Write {
        address,
        payload,
        sender,
      })
      .await
    {
      return Err(SendError::ChannelDisconnected(error.into()));
    };

    match receiver.recv_async().await {
      Ok(response) => response,
      Err(error) => Err(SendError::ChannelDisconnected(error.into())),
    }
  }

  pub(crate) async fn terminate(&self) -> Result<(), TerminateError> {
    let result = self.sender.send_async(TaskRequest::Terminate).await;

    let handle = {
      let mut handle = self.handle.clone().lock_owned().await;
      (*handle).take()
    };
    if let Some(handle) = handle {
      let abort_handle = handle.abort_handle();
      match handle.timeout(self.termination_timeout).await {
        Ok(Ok(_)) => {}
        Err(error) => {
          abort_handle.abort();
          return Err(TerminateError::Timeout(error.into()));
        }
        Ok(Err(error)) => {
          abort_handle.abort();
          return Err(TerminateError::Join(error.into()));
        }
      };
    }

    result.map_err(|error| TerminateError::ChannelDisconnected(error.into()))
  }
}

type TaskHandle = tokio::task::JoinHandle<()>;

type ReadSender = flume::Sender<Result<Vec<Block>, SendError>>;
type WriteSender = flume::Sender<Result<(), SendError>>;

#[derive(Debug)]
enum TaskRequest {
  Read {
    spans: Vec<(BlockKind, SimpleSpan)>,
    sender: ReadSender,
  },
  Write {
    address: Address,
    payload: Payload,
    sender: WriteSender,
  },
  Terminate,
}

type RequestSender = flume::Sender<TaskRequest>;
type RequestReceiver = flume::Receiver<TaskRequest>;

#[derive(Debug)]
struct Task {
  connection: Connection,
  receiver: RequestReceiver,
}

impl Task {
  #[tracing::instrument(skip_all, fields(
    destination = ?self.connection.destination()
  ))]
  async fn execute(mut self) {
    loop {
      let request = match self.receiver.recv_async().await {
        Ok(request) => request,
        Err(flume::RecvError::Disconnected) => break,
      };

      match request {
        TaskRequest::Read { spans, sender } => {
          if sender.is_disconnected() {
            // NOTE: trace because the caller gave up on this cycle already
            tracing::trace!("Skipped read for a cancelled caller");
            continue;
          }

          let response = self.read(spans).await;
          if let Err(error) = sender.try_send(response) {
            // NOTE: error -> trace because this should fail when we already cancelled the future from caller
            tracing::trace!("Failed sending read response {}", error);
          }
        }
        TaskRequest::Write {
          address,
          payload,
          sender,
        } => {
          if sender.is_disconnected() {
            tracing::trace!("Skipped write for a cancelled caller");
            continue;
          }

          let response = self.write(address, payload).await;
          if let Err(error) = sender.try_send(response) {
            // NOTE: error -> trace because this should fail when we already cancelled the future from caller
            tracing::trace!("Failed sending write response {}", error);
          }
        }
        TaskRequest::Terminate => break,
      }
    }

    self.connection.disconnect();
    tracing::trace!("Terminated");
  }

  async fn read(
    &mut self,
    spans: Vec<(BlockKind, SimpleSpan)>,
  ) -> Result<Vec<Block>, SendError> {
    self.connection.connect().await?;

    let mut blocks = Vec::with_capacity(spans.len());
    for (kind, span) in spans {
      blocks.push(self.connection.read_block(kind, span).await?);
    }

    tracing::trace!("Read {} blocks", blocks.len());

    Ok(blocks)
  }

  async fn write(
    &mut self,
    address: Address,
    payload: Payload,
  ) -> Result<(), SendError> {
    self.connection.connect().await?;
    self.connection.write_point(address, payload).await?;

    tracing::trace!("Wrote to {}", address);

    Ok(())
  }
}
