use tracing_subscriber::{
  layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use scadapoll::{config, process, service};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = config::load().await?;

  let filter = EnvFilter::builder()
    .with_default_directive(config.log_level.into())
    .from_env_lossy();
  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer())
    .init();

  let services = service::Container::new(&config);
  services.migrate().await?;

  let processes = process::Container::new(config, services.clone());

  processes.spawn().await;
  tokio::signal::ctrl_c().await?;
  processes.cancel().await;
  services.shutdown().await;

  Ok(())
}
