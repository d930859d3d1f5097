//! contextdb server
//!
//! Wires storage, auth and the engine together and serves the HTTP/WS API
//! until interrupted. Teardown runs in reverse construction order with the
//! store closed last.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use contextdb::api::{self, ApiContext};
use contextdb::auth::AuthManager;
use contextdb::engine::Engine;
use contextdb::storage::{MemoryStore, SqliteStore, StorageConfig, Store};

#[derive(Parser, Debug)]
#[command(name = "contextdb-server", version, about = "Convergent collaborative document store")]
struct Args {
    /// Address to bind the HTTP API on
    #[arg(long, default_value = "127.0.0.1:8788")]
    listen: SocketAddr,

    /// Base directory; the store lives under <base>/.context/
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,

    /// Repository identifier carried in stable addresses
    #[arg(long, default_value = "local")]
    repository: String,

    /// Keep state in memory instead of SQLite (for development)
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = StorageConfig {
        base_dir: args.base_dir,
    };

    let store: Arc<dyn Store> = if args.in_memory {
        info!("using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(SqliteStore::open(&config.base_dir)?)
    };

    let auth = Arc::new(AuthManager::open(&config.base_dir)?);
    let engine = Arc::new(Engine::new(Arc::clone(&store)));
    let ctx = ApiContext::new(engine, auth, args.repository);

    let (addr, server) = warp::serve(api::routes(ctx)).bind_with_graceful_shutdown(
        args.listen,
        async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        },
    );
    info!(%addr, "contextdb listening");
    server.await;

    store.close()?;
    Ok(())
}
