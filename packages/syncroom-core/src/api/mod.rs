//! Gateway API layer (component I): router construction, shared app state,
//! and server startup. Handlers stay thin and delegate to the engines.

use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bus::EventBus;
use crate::chat::ChatPipeline;
use crate::error::SyncResult;
use crate::playback::PlaybackEngine;
use crate::session::SessionEngine;
use crate::state_store::StateStore;
use crate::voice::VoiceRelay;

pub mod ws;
pub mod ws_connection;

pub use ws::ws_handler;
pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Resolves a bearer credential into a connection's identity (§4.I). Token
/// issuance and verification policy are external (§1 Non-goals); the core
/// only needs the resulting identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, bearer_token: Option<&str>) -> SyncResult<AuthContext>;
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub session_id: String,
    pub is_guest: bool,
}

/// Default `Authenticator`: accepts any bearer token as the caller's
/// `user_id`, treating a missing token as an anonymous guest. Real token
/// issuance/verification policy lives outside the core (§1 Non-goals);
/// deployments that need one should implement `Authenticator` themselves.
#[derive(Default)]
pub struct PassthroughAuthenticator;

#[async_trait]
impl Authenticator for PassthroughAuthenticator {
    async fn authenticate(&self, bearer_token: Option<&str>) -> SyncResult<AuthContext> {
        let session_id = uuid::Uuid::new_v4().to_string();
        match bearer_token {
            Some(token) if !token.is_empty() => Ok(AuthContext {
                user_id: Some(token.to_string()),
                session_id,
                is_guest: false,
            }),
            _ => Ok(AuthContext {
                user_id: None,
                session_id,
                is_guest: true,
            }),
        }
    }
}

/// Shared application state for the gateway. Thin: all business logic lives
/// in the engines themselves.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
    pub bus: Arc<dyn EventBus>,
    pub playback: Arc<PlaybackEngine>,
    pub session: Arc<SessionEngine>,
    pub voice: Arc<VoiceRelay>,
    pub chat: Arc<ChatPipeline>,
    pub authenticator: Arc<dyn Authenticator>,
    pub ws_manager: Arc<WsConnectionManager>,
    pub shutdown: CancellationToken,
    pub ping_timeout_ms: u64,
    pub ping_interval_ms: u64,
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn readiness_check(axum::extract::State(state): axum::extract::State<AppState>) -> Json<serde_json::Value> {
    let ready = !state.shutdown.is_cancelled();
    Json(json!({ "status": if ready { "ready" } else { "shutting_down" } }))
}

/// Builds the router: liveness/readiness probes plus the `/sync` WebSocket
/// endpoint (§6 "the namespace path is `/sync`").
pub fn create_router(state: AppState, cors_origins: Vec<String>) -> Router {
    let cors = if cors_origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/sync", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP/WebSocket server, serving until `state.shutdown` fires.
pub async fn start_server(
    state: AppState,
    bind_addr: std::net::SocketAddr,
    cors_origins: Vec<String>,
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    log::info!("[Server] Listening on {}", bind_addr);
    let shutdown = state.shutdown.clone();
    let app = create_router(state, cors_origins);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
