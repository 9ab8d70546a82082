//! The four astoria daemons, each a [`StateManager`] on the shared bus.

pub mod astdiskd;
pub mod astmetad;
pub mod astprocd;
pub mod astupdated;

use std::sync::Arc;

use anyhow::Context;
use tracing::Instrument;

use crate::bus::{SocketTransport, Transport};
use crate::config::AstoriaConfig;
use crate::manager::{self, StateManager};

/// Transport to the `astoria broker` socket named by the config.
pub fn socket_transport(config: &AstoriaConfig) -> Arc<dyn Transport> {
    Arc::new(SocketTransport::new(config.socket_path()))
}

/// Run a manager until a signal or a lost dependency stops it.
pub async fn run_daemon<M: StateManager>(manager: Arc<M>) -> anyhow::Result<()> {
    let name = manager.state().name();
    manager::spawn_signal_handler(manager.state().stop_token().clone())
        .context("Failed to install signal handlers")?;
    manager::run(manager)
        .instrument(tracing::info_span!("daemon", name = name))
        .await
}

pub async fn astdiskd(config: &AstoriaConfig) -> anyhow::Result<()> {
    let provider = astdiskd::MountTableProvider::new(&config.astdiskd);
    let manager = astdiskd::DiskManager::new(
        &config.astdiskd,
        provider,
        config.bus_config(),
        socket_transport(config),
    )?;
    run_daemon(manager).await
}

pub async fn astmetad(config: &AstoriaConfig) -> anyhow::Result<()> {
    let cache_dir = config.cache_dir();
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("Failed to create cache dir {}", cache_dir.display()))?;
    let manager = astmetad::MetadataManager::new(
        crate::metadata::SystemInfo::detect(),
        config.astprocd.default_usercode_entrypoint.clone(),
        &cache_dir,
        config.bus_config(),
        socket_transport(config),
    )?;
    run_daemon(manager).await
}

pub async fn astprocd(config: &AstoriaConfig) -> anyhow::Result<()> {
    let manager = astprocd::ProcessManager::new(
        config.usercode_settings(),
        config.astprocd.default_usercode_entrypoint.clone(),
        config.bus_config(),
        socket_transport(config),
    )?;
    run_daemon(manager).await
}

pub async fn astupdated(config: &AstoriaConfig) -> anyhow::Result<()> {
    let manager = astupdated::UpdateManager::new(
        config.astupdated.install_command.clone(),
        config.kill_grace(),
        config.bus_config(),
        socket_transport(config),
    )?;
    run_daemon(manager).await
}
