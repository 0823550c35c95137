//! Collaboration server binary.
//!
//! Configured from `COLLAB_*` environment variables and `REDIS_URL`; logs
//! through `env_logger` (set `RUST_LOG=info` or `RUST_LOG=collab_room=debug`).

use std::sync::Arc;
use std::time::Duration;

use collab_room::{
    Authenticator, Backbone, CollabServer, Compactor, LocalHub, MemoryStore, RedisBackbone,
    RocksStore, RoomRegistry, ServerConfig, SnapshotStore, StaticAuthenticator, StoreConfig,
    YrsCompactor,
};

/// How long startup waits for the first Redis connection.
const REDIS_CONNECT_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;

    let store: Arc<dyn SnapshotStore> = match &config.storage_path {
        Some(path) => {
            log::info!("Persisting snapshots to {}", path.display());
            Arc::new(RocksStore::open(StoreConfig::new(path))?)
        }
        None => {
            log::warn!("COLLAB_STORAGE_PATH not set, snapshots are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let compactor: Option<Arc<dyn Compactor>> = match config.room.compact_after {
        Some(threshold) => {
            log::info!("Compacting update logs after {} updates", threshold);
            Some(Arc::new(YrsCompactor))
        }
        None => None,
    };

    let auth: Arc<dyn Authenticator> = Arc::new(load_authenticator(&config)?);

    let backbone: Arc<dyn Backbone> = match &config.redis_url {
        Some(url) => {
            log::info!("Sharing rooms with other instances through Redis");
            Arc::new(RedisBackbone::connect(url, REDIS_CONNECT_WAIT).await?)
        }
        None => {
            log::warn!("REDIS_URL not set, rooms are not shared with other instances");
            Arc::new(LocalHub::new().endpoint())
        }
    };

    let registry = RoomRegistry::new(config.room.clone(), store, backbone, compactor);

    let shutdown_timeout = config.shutdown_timeout;
    let server = CollabServer::new(config, registry.clone(), auth);
    let listener = server.bind().await?;
    server.serve(listener, shutdown_signal()).await?;

    log::info!("Saving {} open rooms", registry.room_count().await);
    if !registry.shutdown(shutdown_timeout).await {
        log::error!("Some rooms did not finish saving within {:?}", shutdown_timeout);
    }

    let stats = server.stats();
    log::info!(
        "Served {} connections ({} handshakes rejected)",
        stats.total_connections,
        stats.rejected_handshakes
    );
    Ok(())
}

fn load_authenticator(config: &ServerConfig) -> Result<StaticAuthenticator, Box<dyn std::error::Error>> {
    let auth = match &config.auth_file {
        Some(path) => StaticAuthenticator::from_json(&std::fs::read_to_string(path)?)?,
        None => StaticAuthenticator::new(),
    };
    if config.allow_dev_identity {
        log::warn!("Development identities enabled: unauthenticated clients are accepted");
    } else if config.auth_file.is_none() {
        log::warn!("No COLLAB_AUTH_FILE and development identities disabled: every handshake will be rejected");
    }
    Ok(auth.with_dev_mode(config.allow_dev_identity))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl+C, shutting down"),
        _ = terminate => log::info!("Received SIGTERM, shutting down"),
    }
}
