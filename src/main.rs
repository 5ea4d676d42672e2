use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spreadwatch::{
    BrowserImpersonationClient, ChallengeSolvingClient, ConnectionManager, DexScreenerClient,
    HistoryWriter, JupiterClient, LatestSnapshot, MatchaClient, MexcClient, PriceSource,
    PriceWorker, ProxyPool, ServerConfig, Store, WsServer,
};

#[derive(Parser, Debug)]
#[command(name = "spreadwatch", about = "CEX/DEX spread monitoring server")]
struct Args {
    /// WebSocket bind address, e.g. 0.0.0.0:8000
    #[arg(long)]
    bind: Option<String>,

    /// SQLite database path
    #[arg(long)]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.ws_bind = bind;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }

    info!("Starting spreadwatch server...");
    let store = Store::open(&config.db_path)?;

    // Proxy pool, primed before any upstream call so parallel tasks can
    // pick without touching the store.
    let proxy_pool = Arc::new(ProxyPool::new(
        store.clone(),
        config.proxy_probe_url.clone(),
        config.proxy_fail_threshold,
    ));
    if let Err(e) = proxy_pool.prime() {
        warn!("Initial proxy cache load failed: {}", e);
    }

    // Upstream clients.
    let mexc = Arc::new(MexcClient::new(Arc::clone(&proxy_pool)));
    let jupiter = Arc::new(JupiterClient::new(Arc::clone(&proxy_pool)));
    let pancake = Arc::new(DexScreenerClient::new(Arc::clone(&proxy_pool)));
    let challenge_client: Arc<dyn ChallengeSolvingClient> =
        Arc::new(BrowserImpersonationClient::default());
    let matcha = Arc::new(MatchaClient::new(Arc::clone(&proxy_pool), challenge_client));
    let sources: Vec<Arc<dyn PriceSource>> = vec![
        Arc::clone(&jupiter) as Arc<dyn PriceSource>,
        pancake,
        matcha,
    ];

    // Fan-out and persistence.
    let manager = Arc::new(ConnectionManager::new());
    let snapshot = Arc::new(LatestSnapshot::new());
    let history = HistoryWriter::new(
        store.clone(),
        config.history_retention_hours,
        Duration::from_secs(config.history_flush_secs),
    );

    let worker = PriceWorker::new(
        store,
        mexc,
        jupiter,
        sources,
        Arc::clone(&manager),
        Arc::clone(&snapshot),
        history,
        config.max_workers,
        config.poll_interval,
    );
    worker.start();

    // Proxy health probe loop.
    let probe_running = Arc::new(AtomicBool::new(true));
    let probe_handle = tokio::spawn(
        Arc::clone(&proxy_pool).probe_loop(Arc::clone(&probe_running)),
    );

    // WebSocket server until Ctrl-C.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = Arc::new(WsServer::new(manager, snapshot));
    let server_handle = {
        let bind = config.ws_bind.clone();
        tokio::spawn(async move { server.run(&bind, shutdown_rx).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down spreadwatch server...");

    worker.stop().await;
    probe_running.store(false, Ordering::SeqCst);
    shutdown_tx.send(true).ok();

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
    probe_handle.abort();
    info!("Shutdown complete");
    Ok(())
}
