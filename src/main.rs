use anyhow::Context;
use tracing_subscriber::EnvFilter;

use racetrack_pub::{config::Config, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env().context("load config")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));
    if cfg.log_structured {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::debug!(config = ?cfg, "config values");
    server::run(cfg).await
}
