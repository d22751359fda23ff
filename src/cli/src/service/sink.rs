//! Buffered, append-only writer of readings.
//!
//! Durability: readings waiting in the channel or in the unflushed batch
//! live only in memory and are lost if the process crashes. A graceful
//! shutdown drains the channel and flushes what is left. The poll path
//! never waits on the database, only on channel capacity, and gives up
//! after the configured append timeout.

use std::sync::Arc;

use futures::{stream, Stream, TryStreamExt};
use futures_time::future::FutureExt;
use tokio::sync::Mutex;

use crate::*;

use super::db::{self, Cursor, Query};
use super::export;
use super::modbus::Reading;

#[derive(Debug, Clone)]
pub struct Service {
  sender: RequestSender,
  handle: Arc<Mutex<Option<TaskHandle>>>,
  db: db::Service,
  append_timeout: futures_time::time::Duration,
  termination_timeout: futures_time::time::Duration,
  page_size: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum AppendError {
  #[error("Sink buffer stayed full past the append timeout, {dropped} dropped")]
  Timeout { dropped: usize },

  #[error("Sink is no longer running")]
  ChannelDisconnected(anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum FlushError {
  #[error("Failed inserting readings")]
  Db(#[from] db::Error),

  #[error("Sink is no longer running")]
  ChannelDisconnected(anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TerminateError {
  #[error("Sink is no longer running")]
  ChannelDisconnected(anyhow::Error),

  #[error("Termination timed out")]
  Timeout(anyhow::Error),

  #[error("Failed joining inner handle")]
  Join(anyhow::Error),
}

impl Service {
  pub(crate) fn new(
    config: &config::Values,
    db: db::Service,
    export: export::Service,
  ) -> Self {
    let persistence = &config.persistence;
    let (sender, receiver) = flume::bounded(persistence.channel_capacity);
    let task = Task {
      receiver,
      db: db.clone(),
      export,
      buffer: Vec::with_capacity(persistence.batch_size),
      batch_size: persistence.batch_size,
      capacity: persistence.channel_capacity,
      failing: false,
      flush_interval: std::time::Duration::from_millis(
        persistence.flush_interval.num_milliseconds().max(1) as u64,
      ),
    };
    let handle = tokio::spawn(task.execute());

    Self {
      sender,
      handle: Arc::new(Mutex::new(Some(handle))),
      db,
      append_timeout: to_futures_time(persistence.append_timeout),
      termination_timeout: to_futures_time(config.modbus.termination_timeout),
      page_size: persistence.query_page_size,
    }
  }

  /// Queues a reading for the next batch.
  pub async fn append(&self, reading: Reading) -> Result<(), AppendError> {
    self.append_all(vec![reading]).await
  }

  /// Queues readings in order under a single append timeout.
  ///
  /// Readings not queued by then are dropped and counted in the error.
  pub async fn append_all(
    &self,
    readings: Vec<Reading>,
  ) -> Result<(), AppendError> {
    let total = readings.len();
    let mut queued = 0;
    let send = async {
      for reading in readings {
        self.sender.send_async(Request::Append(reading)).await?;
        queued += 1;
      }
      Ok::<_, flume::SendError<Request>>(())
    };

    let result = send.timeout(self.append_timeout).await;
    match result {
      Ok(Ok(())) => Ok(()),
      Ok(Err(error)) => Err(AppendError::ChannelDisconnected(error.into())),
      Err(_) => Err(AppendError::Timeout {
        dropped: total - queued,
      }),
    }
  }

  /// Writes everything queued so far and waits for the result.
  pub async fn flush(&self) -> Result<(), FlushError> {
    let (sender, receiver) = flume::bounded(1);
    if let Err(error) = self.sender.send_async(Request::Flush(sender)).await {
      return Err(FlushError::ChannelDisconnected(error.into()));
    }

    match receiver.recv_async().await {
      Ok(result) => result,
      Err(error) => Err(FlushError::ChannelDisconnected(error.into())),
    }
  }

  /// Lazily pages through stored readings in ascending timestamp order.
  pub fn query(
    &self,
    query: Query,
  ) -> impl Stream<Item = Result<Reading, db::Error>> + Send + 'static {
    let db = self.db.clone();
    let page_size = self.page_size;

    stream::try_unfold(Page::First, move |page| {
      let db = db.clone();
      let query = query.clone();
      async move {
        let page = next_page(&db, &query, page, page_size).await?;
        Ok::<_, db::Error>(
          page.map(|(readings, next)| (stream::iter(readings), next)),
        )
      }
    })
    .try_flatten()
  }

  /// Stops accepting readings, flushes the rest and waits for the task.
  pub async fn terminate(&self) -> Result<(), TerminateError> {
    let result = self.sender.send_async(Request::Terminate).await;

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

#[derive(Debug, Clone, Copy)]
enum Page {
  First,
  After(Cursor),
  Done,
}

async fn next_page(
  db: &db::Service,
  query: &Query,
  page: Page,
  page_size: u32,
) -> Result<Option<(Vec<Result<Reading, db::Error>>, Page)>, db::Error> {
  let after = match page {
    Page::First => None,
    Page::After(cursor) => Some(cursor),
    Page::Done => return Ok(None),
  };

  let rows = db.get_readings(query, after, page_size).await?;
  let next = match rows.last() {
    Some(last) if rows.len() >= page_size as usize => {
      Page::After(last.cursor())
    }
    Some(_) => Page::Done,
    None => return Ok(None),
  };
  let readings = rows.into_iter().map(Reading::try_from).collect();

  Ok(Some((readings, next)))
}

type TaskHandle = tokio::task::JoinHandle<()>;

#[derive(Debug)]
enum Request {
  Append(Reading),
  Flush(flume::Sender<Result<(), FlushError>>),
  Terminate,
}

type RequestSender = flume::Sender<Request>;
type RequestReceiver = flume::Receiver<Request>;

#[derive(Debug)]
struct Task {
  receiver: RequestReceiver,
  db: db::Service,
  export: export::Service,
  buffer: Vec<Reading>,
  batch_size: usize,
  capacity: usize,
  failing: bool,
  flush_interval: std::time::Duration,
}

impl Task {
  async fn execute(mut self) {
    let mut interval = tokio::time::interval(self.flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        request = self.receiver.recv_async() => match request {
          Ok(Request::Append(reading)) => {
            self.buffer.push(reading);
            // NOTE: after a failed flush only the timer retries
            if self.buffer.len() >= self.batch_size && !self.failing {
              let _ = self.flush().await;
            }
          }
          Ok(Request::Flush(sender)) => {
            let result = self.flush().await;
            if let Err(error) = sender.try_send(result) {
              // NOTE: error -> trace because this should fail when we already cancelled the future from caller
              tracing::trace!("Failed sending flush result {}", error);
            }
          }
          Ok(Request::Terminate) | Err(flume::RecvError::Disconnected) => {
            break
          }
        },
        _ = interval.tick() => {
          let _ = self.flush().await;
        }
      }
    }

    for request in self.receiver.drain() {
      match request {
        Request::Append(reading) => self.buffer.push(reading),
        Request::Flush(sender) => drop(sender),
        Request::Terminate => {}
      }
    }
    if let Err(error) = self.flush().await {
      tracing::error! {
        %error,
        count = self.buffer.len(),
        "Readings lost on shutdown"
      }
    }

    tracing::trace!("Terminated");
  }

  async fn flush(&mut self) -> Result<(), FlushError> {
    if self.buffer.is_empty() {
      return Ok(());
    }

    let batch = std::mem::take(&mut self.buffer);
    match self.db.insert_readings(&batch).await {
      Ok(()) => {
        self.failing = false;
        tracing::debug!("Flushed {} readings", batch.len());
        if let Err(error) = self.export.append(batch).await {
          tracing::warn! {
            %error,
            "Failed mirroring readings to csv"
          }
        }
        Ok(())
      }
      Err(error) => {
        self.failing = true;
        tracing::warn! {
          %error,
          count = batch.len(),
          "Failed flushing readings, retrying next flush"
        };

        let mut retained = batch;
        retained.append(&mut self.buffer);
        if retained.len() > self.capacity {
          let dropped = retained.len() - self.capacity;
          retained.drain(0..dropped);
          tracing::warn!(dropped, "Dropped oldest unflushed readings");
        }
        self.buffer = retained;

        Err(FlushError::Db(error))
      }
    }
  }
}

fn to_futures_time(duration: chrono::Duration) -> futures_time::time::Duration {
  futures_time::time::Duration::from_millis(
    duration.num_milliseconds().max(0) as u64,
  )
}
