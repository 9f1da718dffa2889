use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use haul_cache::{EphemeralStore, MemoryStore, RedisStore};
use haul_engine::HttpAuthority;
use haul_server::{RelayConfig, ServerConfig, Services};
use haul_store::Database;

/// Real-time coordination relay for dispatchers and drivers.
#[derive(Debug, Parser)]
#[command(name = "haul", version)]
struct Args {
    /// Listen on this port instead of `PORT`.
    #[arg(long)]
    port: Option<u16>,

    /// Use the in-process store even when `REDIS_URL` is set.
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = RelayConfig::from_env().context("loading configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    haul_telemetry::init_telemetry(&config.telemetry).context("installing telemetry")?;

    tracing::info!(environment = %config.environment, "starting haul relay");

    let store: Arc<dyn EphemeralStore> = match config.redis_url.as_deref() {
        Some(url) if !args.memory_store => {
            let store = RedisStore::connect(url).await.context("connecting to redis")?;
            tracing::info!("using redis ephemeral store");
            Arc::new(store)
        }
        _ => {
            let store = Arc::new(MemoryStore::new());
            let _reaper = haul_cache::memory::spawn_reaper(&store, Duration::from_secs(1));
            tracing::info!("using in-memory ephemeral store");
            store
        }
    };

    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening database at {}", config.database_path.display()))?;
    tracing::info!(path = %config.database_path.display(), "database opened");

    let authority = HttpAuthority::new(config.authority_base_url.clone(), config.authority_timeout)
        .context("building authority client")?;

    let services = Services::new(store, db, Arc::new(authority));
    let handle = haul_server::start(ServerConfig::from_relay(&config), services)
        .await
        .context("starting server")?;

    tracing::info!(port = handle.port, "haul relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
