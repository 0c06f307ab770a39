//! context-vault - versioned, encrypted context storage over HTTP

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use context_vault::auth::PrincipalResolver;
use context_vault::blob_store::{BlobStore, FsBlobStore};
use context_vault::config::Config;
use context_vault::http::HttpServer;
use context_vault::keys;
use context_vault::metadata::{MetadataIndex, SledIndex};
use context_vault::repository::ContextRepository;

/// Interval between metadata TTL sweeps
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let config = Config::parse();

    // Initialize tracing/logging
    let log_level = config.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("context_vault={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  context-vault - encrypted contexts");
    info!("======================================");
    info!("Listen: {}", config.listen);
    info!("Data dir: {}", config.data_dir.display());
    info!(
        "Mode: {}",
        if config.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" }
    );
    info!("======================================");

    // Object store for encrypted context bodies
    let blobs = FsBlobStore::new(config.blob_dir());
    if let Err(e) = blobs.init().await {
        error!("Failed to initialize object store: {}", e);
        std::process::exit(1);
    }
    let blobs: Arc<dyn BlobStore> = Arc::new(blobs);

    // TTL'd metadata index
    let index = match SledIndex::open(config.metadata_db_path()) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("Failed to open metadata database: {}", e);
            std::process::exit(1);
        }
    };
    let index_dyn: Arc<dyn MetadataIndex> = index.clone();

    // Register configured API keys so opaque-token callers resolve
    let pairs = config.api_key_pairs();
    for (token, user_id) in &pairs {
        index_dyn
            .put(&keys::api_key_lookup(token), user_id.as_bytes(), None)
            .await?;
    }
    if !pairs.is_empty() {
        info!("Registered {} API key(s)", pairs.len());
    }

    let repository = Arc::new(ContextRepository::new(
        blobs,
        index_dyn.clone(),
        &config.encryption_key(),
    ));
    let resolver = Arc::new(PrincipalResolver::new(index_dyn, &config.jwt_secret()));

    // Periodic TTL sweep; lookups also expire lazily, this just reclaims space
    {
        let sweep_index = Arc::clone(&index);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match sweep_index.sweep_expired() {
                    Ok(0) => {}
                    Ok(n) => info!(expired = n, "metadata sweep reclaimed entries"),
                    Err(e) => warn!(error = %e, "metadata sweep failed"),
                }
            }
        });
    }

    // Run the server
    let server = Arc::new(HttpServer::new(repository, resolver, config.listen));
    if let Err(e) = server.run().await {
        error!("Server error: {:?}", e);
        std::process::exit(1);
    }

    Ok(())
}
