//! HTTP surface: carrier webhooks, media WebSocket, staged audio
//!
//! Thin by design. Signature verification and dispatch decisions live in
//! their own modules; handlers here reply fast and push real work onto the
//! session manager's queues.

pub mod media_ws;
pub mod webhook;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::call::SessionManager;
use crate::config::Config;
use crate::signature::WebhookVerifier;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<SessionManager>,
    pub verifier: Arc<WebhookVerifier>,
}

/// Build the router (separated from `start` for tests)
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let audio_dir = state.config.audio.storage_dir.clone();

    Router::new()
        .route("/webhooks/telnyx", post(webhook::handle))
        .route("/v1/telnyx/media/{call_control_id}", get(media_ws::handle))
        .route("/healthz", get(healthz))
        .nest_service("/audio", ServeDir::new(audio_dir))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start serving until the process is stopped
pub async fn start(config: Arc<Config>) -> Result<()> {
    let manager = SessionManager::new(config.clone())
        .await
        .context("building session manager")?;
    let verifier = Arc::new(
        WebhookVerifier::new(
            config.telnyx.public_key.as_deref(),
            config.telnyx.webhook_secret.as_deref(),
            config.telnyx.skip_signature,
        )
        .context("building webhook verifier")?,
    );

    let state = AppState {
        config: config.clone(),
        manager,
        verifier,
    };
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind port {}", config.server.port))?;

    info!(%addr, "voice runtime listening");
    axum::serve(listener, app)
        .await
        .context("http server exited")?;
    Ok(())
}

async fn healthz(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    let sessions = state.manager.session_count().await;
    Json(serde_json::json!({ "ok": true, "sessions": sessions }))
}
