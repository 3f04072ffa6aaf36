//! Axum router: the REST companion surface plus the `/ws/{session_id}`
//! upgrade. Every route is gated by `ResolvedAuth`'s bearer token check —
//! the REST handlers via [`check_auth`] here, the WebSocket upgrade via the
//! same token check in `ws::upgrade` (the entire JSON-RPC Gateway runs over
//! that socket, so gating the upgrade gates every RPC method too).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use loom_agent::AgentRuntime;
use loom_core::types::SessionKey;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::auth::ResolvedAuth;
use crate::ws;

#[derive(Clone)]
pub struct GatewayState {
    pub runtime: Arc<AgentRuntime>,
    pub auth: Arc<ResolvedAuth>,
}

#[derive(Deserialize)]
struct ChatBody {
    message: String,
    session_id: String,
    #[serde(default)]
    provider: Option<String>,
}

#[derive(Deserialize)]
struct ProviderBody {
    provider: String,
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("authorization")?.to_str().ok()?.strip_prefix("Bearer ")
}

fn check_auth(state: &GatewayState, headers: &HeaderMap) -> Result<(), impl IntoResponse> {
    state
        .auth
        .verify_token(bearer_token(headers))
        .map_err(|e| (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": e.to_string() }))))
}

async fn post_chat(State(state): State<GatewayState>, headers: HeaderMap, Json(body): Json<ChatBody>) -> impl IntoResponse {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied.into_response();
    }
    let session_id = SessionKey::new(body.session_id.clone());
    let handle = match state.runtime.handle_chat(session_id.clone(), body.message, body.provider).await {
        Ok(h) => h,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() }))).into_response(),
    };
    match handle.wait().await {
        Ok(response) => Json(serde_json::json!({ "response": response, "session_id": session_id.as_str() })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": e.to_string() }))).into_response(),
    }
}

async fn post_clear(State(state): State<GatewayState>, headers: HeaderMap, Path(session_id): Path<String>) -> impl IntoResponse {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied.into_response();
    }
    let key = SessionKey::new(session_id.clone());
    state.runtime.clear_session(&key).await;
    Json(serde_json::json!({ "status": "cleared", "session_id": session_id })).into_response()
}

async fn post_provider(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<ProviderBody>,
) -> impl IntoResponse {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied.into_response();
    }
    let key = SessionKey::new(session_id.clone());
    if !state.runtime.set_provider(&key, &body.provider).await {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("unknown provider '{}'", body.provider) })),
        )
            .into_response();
    }
    Json(serde_json::json!({ "status": "ok", "session_id": session_id, "provider": body.provider })).into_response()
}

async fn get_status(State(state): State<GatewayState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied.into_response();
    }
    let lane = state.runtime.lane_status().await;
    Json(serde_json::json!({
        "status": "ok",
        "active_subagents": lane.active,
        "queued_subagents": lane.queued,
    }))
    .into_response()
}

async fn get_subagents(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied.into_response();
    }
    let key = SessionKey::new(session_id);
    Json(serde_json::json!({ "subagents": state.runtime.subagents_for(&key) })).into_response()
}

async fn get_config(State(state): State<GatewayState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied.into_response();
    }
    Json(state.runtime.config_view()).into_response()
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/chat", post(post_chat))
        .route("/clear/:session_id", post(post_clear))
        .route("/provider/:session_id", post(post_provider))
        .route("/status", get(get_status))
        .route("/subagents/:session_id", get(get_subagents))
        .route("/config", get(get_config))
        .route("/ws/:session_id", get(ws::upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_gateway(state: GatewayState, bind: SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    info!(%bind, "gateway listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
