//! # meshrelay-server
//!
//! Reference store-and-forward relay for meshrelay nodes that cannot reach
//! each other over the mesh.
//!
//! This binary provides:
//! - **Content-addressed blob storage**: ciphertext stored on disk under
//!   its BLAKE3 hash, never decrypted
//! - **Rendezvous mailboxes** telling a recipient which handles to fetch
//! - **REST API** (axum) for both, plus a health check
//! - **Per-IP rate limiting** to protect against abuse

mod api;
mod blob_store;
mod config;
mod error;
mod rate_limit;
mod rendezvous;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::blob_store::BlobStore;
use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use crate::rendezvous::Rendezvous;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,meshrelay_server=debug")),
        )
        .init();

    info!("Starting meshrelay cloud relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let blob_store =
        Arc::new(BlobStore::new(config.blob_storage_path.clone(), config.max_blob_size).await?);

    let rate_limiter = RateLimiter::new(config.rate_limit_requests, config.rate_limit_window);

    let app_state = AppState {
        blob_store,
        rendezvous: Rendezvous::new(config.mailbox_cap),
        rate_limiter: rate_limiter.clone(),
    };

    // -----------------------------------------------------------------------
    // 4. Background tasks
    // -----------------------------------------------------------------------
    // Forget clients idle for 10 minutes, checked every 5
    let purge = rate_limiter.spawn_purge(Duration::from_secs(300), Duration::from_secs(600));

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server until it fails or Ctrl+C
    // -----------------------------------------------------------------------
    let result = tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    purge.abort();
    result
}
