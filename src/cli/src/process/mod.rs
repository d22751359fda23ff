mod poll;

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{config, service};

pub(crate) trait Process {
  fn process_name(&self) -> &'static str {
    std::any::type_name::<Self>()
  }
}

#[async_trait::async_trait]
pub(crate) trait Recurring: Process {
  async fn execute(&self) -> anyhow::Result<()>;

  /// Runs once after cancellation, before the handle resolves.
  async fn finish(&self) {}
}

pub struct Container {
  config: config::Values,
  services: service::Container,
  handles: Arc<Mutex<Option<Vec<Handle>>>>,
}

impl Container {
  pub fn new(config: config::Values, services: service::Container) -> Self {
    Self {
      config,
      services,
      handles: Arc::new(Mutex::new(None)),
    }
  }

  pub async fn spawn(&self) {
    let specs = vec![RecurringSpec {
      process: Box::new(poll::Process::new(
        self.config.clone(),
        self.services.clone(),
      )),
      interval: self.config.poll_interval,
    }];

    let mut handles = self.handles.clone().lock_owned().await;
    *handles = Some(specs.into_iter().map(Handle::recurring).collect());
  }

  /// Stops ticking and waits for every process to finish.
  pub async fn cancel(&self) {
    let mut handles = self.handles.clone().lock_owned().await;
    if let Some(handles) = &mut *handles {
      for handle in handles.iter() {
        handle.token.cancel();
      }

      for handle in handles.drain(0..) {
        if let Err(error) = handle.join.await {
          tracing::error! {
            %error,
            "Joining process handle on cancel failed"
          }
        }
      }
    }
    *handles = None;
  }
}

struct Handle {
  token: tokio_util::sync::CancellationToken,
  join: tokio::task::JoinHandle<()>,
}

struct RecurringSpec {
  process: Box<dyn Recurring + Sync + Send>,
  interval: chrono::Duration,
}

impl Handle {
  fn recurring(spec: RecurringSpec) -> Self {
    let token = tokio_util::sync::CancellationToken::new();
    let child_token = token.child_token();
    let join = tokio::spawn(async move {
      let mut interval =
        tokio::time::interval(std::time::Duration::from_millis(
          spec.interval.num_milliseconds().max(1) as u64,
        ));
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

      loop {
        tokio::select! {
          _ = child_token.cancelled() => { break; },
          _ = interval.tick() => {
            if let Err(error) = spec.process.execute().await {
              tracing::error!(
                "Process execution failed {} for {}",
                error,
                spec.process.process_name()
              );
            }
          }
        }
      }

      spec.process.finish().await;
    });

    Self { token, join }
  }
}
