//! JSON-RPC 2.0 dispatch: the `chat.send` / `session.clear` / `agent.stop` /
//! `system.ping` method set, framed against a single session.

use std::sync::Arc;

use loom_agent::AgentRuntime;
use loom_core::protocol::{RpcError, RpcId, RpcRequest, RpcResponse};
use loom_core::types::SessionKey;
use serde::Deserialize;
use serde_json::Value;

pub struct RpcContext {
    pub runtime: Arc<AgentRuntime>,
    pub session_id: SessionKey,
}

#[derive(Deserialize)]
struct ChatSendParams {
    message: String,
    #[serde(default)]
    provider: Option<String>,
}

/// Dispatches one parsed request, returning `None` for notifications (no
/// `id`, including an explicit `id: null` — `RpcRequest::is_notification`
/// already treats the two identically, which is exactly the "requests with
/// `id=null`" exemption the RPC error-shape property carves out).
pub async fn dispatch(ctx: &RpcContext, request: RpcRequest) -> Option<RpcResponse> {
    let id = request.id.clone()?;
    let result = handle(ctx, &request.method, request.params).await;
    Some(match result {
        Ok(value) => RpcResponse::ok(id, value),
        Err(error) => RpcResponse::err(id, error),
    })
}

async fn handle(ctx: &RpcContext, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "chat.send" => {
            let params: ChatSendParams =
                serde_json::from_value(params).map_err(|e| RpcError::invalid_params(e.to_string()))?;
            let handle = ctx
                .runtime
                .handle_chat(ctx.session_id.clone(), params.message, params.provider)
                .await
                .map_err(|e| RpcError::invalid_params(e.to_string()))?;
            let reply = handle.wait().await.map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(Value::String(reply))
        }
        "session.clear" => {
            ctx.runtime.clear_session(&ctx.session_id).await;
            Ok(Value::String("cleared".to_string()))
        }
        "agent.stop" => {
            ctx.runtime.cancel_session(&ctx.session_id).await;
            Ok(Value::String("stopped".to_string()))
        }
        "system.ping" => Ok(Value::String("pong".to_string())),
        other => Err(RpcError::method_not_found(other)),
    }
}

/// Builds an error response for inbound text that never became an
/// `RpcRequest` at all — malformed JSON, or JSON missing the required
/// `method` field. `RpcId` has no null variant (every `RpcResponse` is only
/// ever built for a request that carried a real id), so this one case is
/// built as a raw value instead of going through `RpcResponse`.
pub fn raw_error_response(error: RpcError) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": Value::Null,
        "error": error,
    })
}
