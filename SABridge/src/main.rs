use sababs::AbsClient;
use sabcache::{CacheGate, CacheIndex, CachePool, Transcoder, WarmupScheduler};
use sabcontrol::Discovery;
use sabplayer::{player_router, spawn_tickers, Orchestrator, PlayerState};
use sabserver::{
    api_router, auth_router, stream_router, ApiState, AuthState, Server, StreamState,
    StreamTokenIssuer,
};
use sabstore::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SAB_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ========== PHASE 1 : configuration & storage ==========

    let config = sabconfig::Config::from_env()?;
    std::fs::create_dir_all(&config.config_dir)?;
    std::fs::create_dir_all(&config.cache_dir)?;

    let store = Arc::new(Store::open(&config.database_path())?);
    info!("💾 Database ready at {}", config.database_path().display());

    let index = Arc::new(CacheIndex::new(Arc::clone(&store), &config.cache_dir));
    index.startup_recovery()?;

    let root = CancellationToken::new();

    // ========== PHASE 2 : components ==========

    let abs = AbsClient::new(&config.abs_url)?;
    let cipher = config.token_cipher()?;
    let issuer = Arc::new(StreamTokenIssuer::new(
        &config.session_secret,
        config.token_ttl_secs,
    ));
    let transcoder = Arc::new(Transcoder::default());

    let (pool, worker_handles) = CachePool::start(
        Arc::clone(&index),
        Arc::clone(&transcoder),
        config.workers,
        root.clone(),
    );
    info!("🛠  {} cache worker(s) running", config.workers);

    let gate = CacheGate::new(Arc::clone(&index), Arc::clone(&transcoder));
    let discovery = Discovery::new(Arc::clone(&store));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        gate,
        abs.clone(),
        Arc::clone(&issuer),
        config.path_mapper(),
        &config.public_url,
    ));

    let warmup = WarmupScheduler::new(
        Arc::clone(&index),
        pool.clone(),
        Arc::clone(&store),
        abs.clone(),
        cipher.clone(),
        config.path_mapper(),
    );
    let warmup_handle = tokio::spawn(warmup.run(root.clone()));

    let ticker_handles = spawn_tickers(Arc::clone(&orchestrator), cipher.clone(), root.clone());

    // Initial discovery in the background; playback works without it once
    // devices are in the registry
    {
        let discovery = discovery.clone();
        tokio::spawn(async move {
            match discovery.discover().await {
                Ok(found) => info!("📡 Initial discovery found {} device(s)", found),
                Err(e) => warn!("Initial discovery failed: {}", e),
            }
        });
    }

    // ========== PHASE 3 : HTTP surface ==========

    let auth_state = AuthState {
        store: Arc::clone(&store),
        abs: abs.clone(),
        cipher: cipher.clone(),
    };

    let mut server = Server::new("SABridge", config.listen_port);
    server
        .add_router(
            "/",
            stream_router(StreamState {
                index: Arc::clone(&index),
                issuer: Arc::clone(&issuer),
            }),
        )
        .await;
    server.add_router("/", auth_router(auth_state.clone())).await;
    server
        .add_router(
            "/",
            api_router(ApiState {
                auth: auth_state.clone(),
                index: Arc::clone(&index),
            }),
        )
        .await;
    server
        .add_router(
            "/",
            player_router(PlayerState {
                auth: auth_state,
                orchestrator: Arc::clone(&orchestrator),
                discovery,
            }),
        )
        .await;
    server.guard_networks(config.allowed_networks.clone()).await;

    server.start(root.clone()).await?;
    info!("✅ SABridge is ready at {}", config.public_url);

    // ========== Shutdown ==========

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    root.cancel();
    server.wait().await;

    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
        for handle in ticker_handles {
            let _ = handle.await;
        }
        let _ = warmup_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        warn!("Drain timed out after {:?}", SHUTDOWN_DRAIN);
    }

    info!("✅ SABridge stopped");
    Ok(())
}
