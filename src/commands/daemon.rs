use astoria::bus::BrokerServer;
use astoria::config::AstoriaConfig;
use astoria::manager::spawn_signal_handler;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub(crate) async fn cmd_broker(config: &AstoriaConfig) -> anyhow::Result<()> {
    let stop = CancellationToken::new();
    spawn_signal_handler(stop.clone())?;

    let server = BrokerServer::new(config.socket_path());
    server
        .run(stop)
        .instrument(tracing::info_span!("daemon", name = "broker"))
        .await
}
