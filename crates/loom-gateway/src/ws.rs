//! WebSocket upgrade handler for `/ws/{session_id}`: frames the JSON-RPC
//! channel over axum's WebSocket, forwarding the session's Hub events back
//! as `agent.*` notifications. Gated by the same bearer token the REST
//! surface checks — the upgrade itself is rejected before any RPC method
//! runs, since the whole JSON-RPC Gateway lives on this socket.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use loom_core::protocol::{RpcError, RpcNotification, RpcRequest};
use loom_core::types::{Event, EventKind, SessionKey};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::rpc::{self, RpcContext};
use crate::server::{bearer_token, GatewayState};

pub async fn upgrade(
    State(state): State<GatewayState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = state.auth.verify_token(bearer_token(&headers)) {
        return (StatusCode::UNAUTHORIZED, serde_json::json!({ "error": e.to_string() }).to_string()).into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, SessionKey::new(session_id)))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState, session_id: SessionKey) {
    let ctx = RpcContext {
        runtime: state.runtime.clone(),
        session_id: session_id.clone(),
    };
    let mut events = state.runtime.subscribe(&session_id);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(incoming)) = incoming else { break };
                let text = match incoming {
                    WsMessage::Text(t) => t,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                let payload = match serde_json::from_str::<RpcRequest>(&text) {
                    Ok(request) => rpc::dispatch(&ctx, request).await.and_then(|r| serde_json::to_string(&r).ok()),
                    Err(e) => serde_json::to_string(&rpc::raw_error_response(RpcError::parse_error(e.to_string()))).ok(),
                };
                if let Some(payload) = payload {
                    if socket.send(WsMessage::Text(payload)).await.is_err() {
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let notification = RpcNotification::new(event.kind.rpc_method(), event.payload);
                        let Ok(payload) = serde_json::to_string(&notification) else { continue };
                        if socket.send(WsMessage::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session = session_id.as_str(), skipped, "websocket subscriber lagged, events dropped");
                        let overflow = Event::new(
                            session_id.as_str(),
                            EventKind::Overflow,
                            serde_json::json!({ "skipped": skipped }),
                        );
                        let notification = RpcNotification::new(overflow.kind.rpc_method(), overflow.payload);
                        let Ok(payload) = serde_json::to_string(&notification) else { continue };
                        if socket.send(WsMessage::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    // Client disconnect cancels the session's in-flight turn and any
    // subagent runs it owns, per spec's session-level cancellation model.
    state.runtime.cancel_session(&session_id).await;
    debug!(session = session_id.as_str(), "websocket connection closed");
}
