//! Relay server binary.

use relayd::chain::{ChainAccess, EthersChain};
use relayd::keys::LocalKeyStore;
use relayd::tx_store::RocksTxStore;
use relayd::{create_router, Config, RelayServer};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting relay server");

    let config: Config = config::Config::builder()
        .add_source(config::File::with_name("relayd").required(false))
        .add_source(config::Environment::with_prefix("RELAYD"))
        .build()?
        .try_deserialize()
        .unwrap_or_default();

    info!(hub = ?config.relay_hub_address, rpc = %config.rpc_url, "Configuration loaded");

    let chain = Arc::new(EthersChain::new(&config.rpc_url, config.relay_hub_address)?);
    let chain_id = chain.chain_id().await?;
    let keys = Arc::new(LocalKeyStore::load(
        &config.keystore_path,
        chain_id,
        config.dev_mode,
    )?);
    let store = Arc::new(RocksTxStore::open(Path::new(&config.tx_store_path))?);

    let bind_address = config.bind_address.clone();
    let server = RelayServer::init(config, chain, keys, store).await?;

    info!(
        manager = ?server.manager_address(),
        worker = ?server.worker_address(),
        "Relay server initialized, spawning reconciliation loop"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&server).run(stop_rx.clone()));
    tokio::spawn(Arc::clone(&server).run_watchdog(stop_rx));

    let app = create_router(server);
    info!(address = %bind_address, "Listening");

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown requested, stopping reconciliation");
            let _ = stop_tx.send(true);
        })
        .await?;

    Ok(())
}
