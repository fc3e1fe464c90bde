use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{Method, StatusCode},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use meshrelay_shared::protocol::{BlobUploaded, PendingHandles, RendezvousNotify};
use meshrelay_shared::types::PeerKey;

use crate::blob_store::{validate_handle, BlobStore};
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::rendezvous::Rendezvous;

#[derive(Clone)]
pub struct AppState {
    pub blob_store: Arc<BlobStore>,
    pub rendezvous: Rendezvous,
    pub rate_limiter: RateLimiter,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/blobs", post(blob_upload))
        .route("/blobs/:handle", get(blob_download))
        .route("/rendezvous/:peer", post(rendezvous_notify).get(rendezvous_poll))
        .layer(DefaultBodyLimit::max(state.blob_store.max_size()))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn blob_upload(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<BlobUploaded>), ServerError> {
    let handle = state.blob_store.store_blob(&body).await?;
    info!(handle = %handle, size = body.len(), "Blob uploaded via API");
    Ok((StatusCode::CREATED, Json(BlobUploaded { handle })))
}

async fn blob_download(
    State(state): State<AppState>,
    Path(handle): Path<String>,
) -> Result<Vec<u8>, ServerError> {
    state.blob_store.get_blob(&handle).await
}

async fn rendezvous_notify(
    State(state): State<AppState>,
    Path(peer): Path<String>,
    Json(req): Json<RendezvousNotify>,
) -> Result<StatusCode, ServerError> {
    let peer = parse_peer(&peer)?;
    validate_handle(&req.handle)?;

    state.rendezvous.notify(peer, req.handle).await;
    Ok(StatusCode::ACCEPTED)
}

async fn rendezvous_poll(
    State(state): State<AppState>,
    Path(peer): Path<String>,
) -> Result<Json<PendingHandles>, ServerError> {
    let peer = parse_peer(&peer)?;
    let handles = state.rendezvous.drain(&peer).await;
    if !handles.is_empty() {
        info!(peer = %peer.short(), count = handles.len(), "Mailbox drained");
    }
    Ok(Json(PendingHandles { handles }))
}

fn parse_peer(hex: &str) -> Result<PeerKey, ServerError> {
    PeerKey::from_hex(hex).map_err(|e| ServerError::BadRequest(format!("Invalid peer key: {e}")))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
