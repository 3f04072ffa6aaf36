//! Core data types shared across the orchestration server.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Session identifier — cheaply cloneable, used as a map key everywhere.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct SessionKey(Arc<str>);

impl SessionKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Message role.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a planner turn's history. Immutable once appended.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: None,
        }
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: Some(tool_calls),
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            tool_calls: None,
        }
    }
}

/// A tool call emitted by the LLM client. `id` is opaque and unique within a turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// The uniform result shape every tool invocation returns.
///
/// `output` is fed back to the LLM as the tool message's content; `data` is
/// structured payload for client-side rendering and is never shown to the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn ok_with_data(output: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: Some(data),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            data: None,
        }
    }
}

/// Tool definition surfaced to the LLM client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Status of a `SubAgentRun`. Monotonic: PENDING -> RUNNING -> {COMPLETED, ERROR, TIMEOUT}.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Error,
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error | RunStatus::Timeout)
    }

    /// Whether `self -> next` is a legal edge in the status DAG.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Completed)
                | (Pending, Error)
                | (Pending, Timeout)
                | (Running, Completed)
                | (Running, Error)
                | (Running, Timeout)
        )
    }
}

/// The durable unit tracked by the Subagent Registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubAgentRun {
    pub run_id: String,
    pub parent_session_id: String,
    pub task: String,
    pub label: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl SubAgentRun {
    pub fn new(
        run_id: impl Into<String>,
        parent_session_id: impl Into<String>,
        task: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            parent_session_id: parent_session_id.into(),
            task: task.into(),
            label: label.into(),
            status: RunStatus::Pending,
            result: None,
            error: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            model: None,
        }
    }
}

/// Structured event published by core components to the Hub and Trace Sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub ts: chrono::DateTime<chrono::Utc>,
}

impl Event {
    pub fn new(session_id: impl Into<String>, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            payload,
            ts: chrono::Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Thinking,
    ToolCalls,
    ToolResult,
    AgentRegistered,
    AgentUpdated,
    Complete,
    Status,
    /// A subscriber's broadcast buffer overflowed and events were dropped
    /// before it could read them. Carries `{"skipped": <count>}` as payload.
    Overflow,
}

impl EventKind {
    /// Method name used when this event is framed as a JSON-RPC notification.
    pub fn rpc_method(self) -> &'static str {
        match self {
            EventKind::Thinking => "agent.thinking",
            EventKind::ToolCalls => "agent.tool_calls",
            EventKind::ToolResult => "agent.tool_result",
            EventKind::AgentRegistered => "agent.registered",
            EventKind::AgentUpdated => "agent.updated",
            EventKind::Complete => "agent.complete",
            EventKind::Status => "agent.status",
            EventKind::Overflow => "agent.overflow",
        }
    }
}

/// Gateway bind/listen configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub bind: BindMode,
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_port() -> u16 {
    8787
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: BindMode::default(),
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Loopback,
    #[default]
    Lan,
}

impl BindMode {
    pub fn to_addr(&self) -> &str {
        match self {
            BindMode::Loopback => "127.0.0.1",
            BindMode::Lan => "0.0.0.0",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    pub token: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Token,
}

/// Capability requirements a persona needs from the loaded plugin set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersonaRequirements {
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub core_tools: Vec<String>,
    #[serde(default)]
    pub plugin_tools: Vec<String>,
}

/// A named bundle of (system prompt, capability requirements). `eligible` is
/// computed once at startup by validating `requires` against the registered
/// plugin/tool set — never recomputed per request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub requires: PersonaRequirements,
    pub eligible: bool,
}

/// A time-triggered planner invocation, persisted independently of sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub expression: String,
    pub task: String,
    pub session_id: String,
    pub enabled: bool,
    pub next_run: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<chrono::DateTime<chrono::Utc>>,
    pub run_count: u64,
}

/// One append-only journal entry in a session's Trace Sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceRecord {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub session_id: String,
    pub turn: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}
