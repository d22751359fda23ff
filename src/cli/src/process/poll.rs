use std::{collections::HashMap, sync::Arc};

use futures_time::future::FutureExt;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{service::modbus::DeviceReadError, *};

/// Acquires every device once per tick.
///
/// Each device runs in its own task so a slow or failing device never holds
/// up the others. A device whose previous acquisition is still running skips
/// the tick.
pub(crate) struct Process {
  config: config::Values,
  services: service::Container,
  inflight: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl Process {
  pub(crate) fn new(
    config: config::Values,
    services: service::Container,
  ) -> Self {
    Self {
      config,
      services,
      inflight: Arc::new(Mutex::new(HashMap::new())),
    }
  }
}

impl super::Process for Process {}

#[async_trait::async_trait]
impl super::Recurring for Process {
  #[tracing::instrument(skip(self))]
  async fn execute(&self) -> anyhow::Result<()> {
    let mut inflight = self.inflight.clone().lock_owned().await;

    for device in self.services.modbus().ids() {
      if let Some(handle) = inflight.get(device) {
        if !handle.is_finished() {
          tracing::warn! {
            device,
            "Previous acquisition still running, skipping tick"
          };
          continue;
        }
      }

      let handle =
        tokio::spawn(acquire(self.services.clone(), device.to_owned()));
      inflight.insert(device.to_owned(), handle);
    }

    Ok(())
  }

  /// Gives running acquisitions the shutdown grace period, then aborts them.
  async fn finish(&self) {
    let handles = {
      let mut inflight = self.inflight.clone().lock_owned().await;
      inflight.drain().collect::<Vec<_>>()
    };
    let grace = futures_time::time::Duration::from_millis(
      self.config.modbus.shutdown_grace.num_milliseconds().max(0) as u64,
    );

    let waits = handles.into_iter().map(|(device, handle)| async move {
      let abort_handle = handle.abort_handle();
      match handle.timeout(grace).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
          tracing::warn! {
            %device,
            %error,
            "Acquisition task failed"
          }
        }
        Err(_) => {
          abort_handle.abort();
          tracing::warn! {
            %device,
            "Acquisition cancelled after shutdown grace period"
          }
        }
      }
    });
    futures::future::join_all(waits).await;
  }
}

#[tracing::instrument(skip(services))]
async fn acquire(services: service::Container, device: String) {
  let readings = match services.modbus().acquire(&device).await {
    Ok(readings) => readings,
    Err(DeviceReadError::Connect(error)) => {
      // NOTE: the cache keeps serving previous values of this device
      tracing::warn! {
        %device,
        error = %error,
        "Device unreachable, skipped this cycle"
      };
      return;
    }
    Err(error) => {
      tracing::warn! {
        %device,
        %error,
        "Acquisition failed"
      };
      return;
    }
  };

  services.cache().put_all(readings.iter().cloned());

  if let Err(error) = services.sink().append_all(readings).await {
    tracing::warn! {
      %device,
      %error,
      "Dropped readings"
    };
  }
}
