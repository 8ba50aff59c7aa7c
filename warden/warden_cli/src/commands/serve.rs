//! `warden serve`: run the elevated broker host.
//!
//! In a deployed installation this command runs as the elevated
//! principal; consent and privilege acquisition happen before launch and
//! are not this process's concern.

use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use warden_broker::{BrokerConfig, BrokerHost};

pub async fn run(config_path: Option<String>, socket: Option<PathBuf>) -> Result<()> {
    let mut config = BrokerConfig::load(config_path.as_deref()).await?;
    if let Some(socket) = socket {
        config.socket_path = socket;
        config.validate()?;
    }

    let registry = warden_zones::builtin_registry()?;
    let mut host = BrokerHost::new(config, registry);
    host.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, draining");

    host.shutdown().await
}
