//! `dhtd`: a standalone Mainline BitTorrent DHT node.
use clap::Parser;
use dhtd::config::{Args, Config};
use dhtd::dht::Server;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from(args);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (server, mut peer_events) = Server::bind(config).await?;
    info!(local_id = %server.local_id(), "dht node started");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    tokio::spawn(async move {
        while let Some(announced) = peer_events.recv().await {
            info!(
                info_hash = %announced.info_hash,
                peer = %announced.peer,
                "peer announced"
            );
        }
    });

    server.run(shutdown_rx).await
}
