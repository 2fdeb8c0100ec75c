use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;

use crate::gateway::{GenerationGateway, GenerationRequest};

pub const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GenerationGateway>,
    /// Read the client address from `X-Forwarded-For`. Only safe behind a
    /// proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

pub fn router(gateway: Arc<GenerationGateway>, trust_forwarded_for: bool) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/health", get(health))
        .with_state(AppState {
            gateway,
            trust_forwarded_for,
        })
}

/// Rate-limit identity: the peer address, or the first `X-Forwarded-For`
/// hop when the proxy in front is trusted.
pub fn client_identity(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if !trust_forwarded_for {
        return peer.ip().to_string();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn chat(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<GenerationRequest>,
) -> Response {
    let identity = client_identity(&headers, peer, state.trust_forwarded_for);
    match state.gateway.generate(&identity, req).await {
        Ok(lines) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, NDJSON)],
            Body::from_stream(lines.map(Ok::<_, Infallible>)),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

/// Serve `app` (see [`router`]) until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}
