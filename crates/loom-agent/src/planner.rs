//! Planner Loop (spec C7): the central iterative LLM<->tool state machine.
//! One `run_turn` call drives history windowing, thought-marker extraction,
//! access control, and tool dispatch through to a final assistant reply or
//! a truncation marker at `max_iterations`.

use crate::hub::PubSubHub;
use crate::security::AccessControl;
use crate::trace::TraceSink;
use loom_core::types::{Event, EventKind, Message, Role, SessionKey, ToolCall};
use loom_llm::client::{FinishReason, LlmClient, DEFAULT_THINKING_END, DEFAULT_THINKING_START};
use loom_llm::types::{validate_and_heal_messages, ContentBlock, LlmContent, LlmMessage, LlmRequest};
use loom_tools::{ToolContext, ToolRegistry};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SPAWN_SUBAGENT_TOOL: &str = "spawn_subagent";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlannerMode {
    Normal,
    /// A nested Planner instance driving a subagent run (spec §4.7): no
    /// `spawn_subagent` (no recursion), single-turn history, and a tighter
    /// iteration budget.
    Subagent,
}

/// Folds dropped history into a new summary string, given the prior summary
/// if one was already carried forward. Absent, dropped messages are simply
/// discarded (spec's baseline windowing behavior).
pub type Summarizer = Arc<dyn Fn(&[Message], Option<&str>) -> String + Send + Sync>;

const SUMMARY_MARKER: &str = "[history summary] ";

#[derive(Clone)]
pub struct PlannerConfig {
    pub max_iterations: usize,
    pub max_tool_calls_per_turn: usize,
    pub max_history_messages: usize,
    pub subagent_timeout_seconds: u64,
    pub enable_thinking: bool,
    pub thinking_start: String,
    pub thinking_end: String,
    pub summarizer: Option<Summarizer>,
}

impl std::fmt::Debug for PlannerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannerConfig")
            .field("max_iterations", &self.max_iterations)
            .field("max_tool_calls_per_turn", &self.max_tool_calls_per_turn)
            .field("max_history_messages", &self.max_history_messages)
            .field("subagent_timeout_seconds", &self.subagent_timeout_seconds)
            .field("enable_thinking", &self.enable_thinking)
            .field("thinking_start", &self.thinking_start)
            .field("thinking_end", &self.thinking_end)
            .field("summarizer", &self.summarizer.is_some())
            .finish()
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            max_tool_calls_per_turn: 16,
            max_history_messages: 50,
            subagent_timeout_seconds: 120,
            enable_thinking: true,
            thinking_start: DEFAULT_THINKING_START.to_string(),
            thinking_end: DEFAULT_THINKING_END.to_string(),
            summarizer: None,
        }
    }
}

/// Per-turn parameters that vary by caller; everything else lives on
/// `Planner` itself.
pub struct TurnRequest<'a> {
    pub session_id: SessionKey,
    pub role: Option<&'a str>,
    pub system_prompt: &'a str,
    pub model: &'a str,
    pub mode: PlannerMode,
    pub cancel: CancellationToken,
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    access: Arc<AccessControl>,
    hub: Arc<PubSubHub>,
    trace: Arc<TraceSink>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        access: Arc<AccessControl>,
        hub: Arc<PubSubHub>,
        trace: Arc<TraceSink>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            llm,
            tools,
            access,
            hub,
            trace,
            config,
        }
    }

    /// Runs one turn to completion. `history` is owned by the caller's
    /// Session and mutated in place; the returned string is the turn's
    /// final assistant reply (possibly empty, on truncation).
    pub async fn run_turn(
        &self,
        req: TurnRequest<'_>,
        history: &mut Vec<Message>,
        user_text: String,
    ) -> String {
        history.push(Message::user(user_text));
        if req.mode == PlannerMode::Normal {
            self.enforce_history_window(history);
        }

        let session = req.session_id.as_str().to_string();
        let turn = self.trace.next_turn(&session);
        self.trace
            .record(&session, turn, "turn.start", json!({}), None)
            .await;
        self.hub.publish(
            &req.session_id,
            Event::new(session.clone(), EventKind::Thinking, json!({"status": "processing"})),
        );

        let max_iterations = match req.mode {
            PlannerMode::Subagent => 5,
            PlannerMode::Normal => self.config.max_iterations,
        };

        let mut tool_call_budget = self.config.max_tool_calls_per_turn;
        let mut last_text = String::new();
        let mut truncated = true;

        for _ in 0..max_iterations {
            if req.cancel.is_cancelled() {
                self.trace
                    .record(&session, turn, "turn.end", json!({"cancelled": true}), None)
                    .await;
                return last_text;
            }

            let request = self.build_request(history, &req);
            self.trace
                .record(&session, turn, "llm.request", json!({"model": req.model}), None)
                .await;
            let response = self.llm.generate(request, Some(req.cancel.clone())).await;
            self.trace
                .record(
                    &session,
                    turn,
                    "llm.response",
                    json!({"finish_reason": response.finish_reason}),
                    None,
                )
                .await;

            let content = response.content.clone().unwrap_or_default();
            let visible_text = if self.config.enable_thinking {
                let (segments, remainder) =
                    extract_thinking(&content, &self.config.thinking_start, &self.config.thinking_end);
                for segment in segments {
                    self.hub.publish(
                        &req.session_id,
                        Event::new(session.clone(), EventKind::Thinking, json!({"text": segment})),
                    );
                    self.trace
                        .record(&session, turn, "thinking", json!({"text": segment}), None)
                        .await;
                }
                remainder
            } else {
                content
            };
            last_text = visible_text.clone();

            if response.finish_reason == FinishReason::Error {
                // An LLM error is surfaced as the turn's reply, per spec §7.
                history.push(Message::assistant(visible_text.clone()));
                self.emit_complete(&req.session_id, &session, turn, true).await;
                return visible_text;
            }

            if response.tool_calls.is_empty() {
                history.push(Message::assistant(visible_text.clone()));
                truncated = false;
                break;
            }

            history.push(Message::assistant_with_tools(visible_text, response.tool_calls.clone()));
            self.hub.publish(
                &req.session_id,
                Event::new(
                    session.clone(),
                    EventKind::ToolCalls,
                    json!({"tool_calls": response.tool_calls}),
                ),
            );
            self.trace
                .record(
                    &session,
                    turn,
                    "tool.call",
                    json!({"tool_calls": response.tool_calls}),
                    None,
                )
                .await;

            for call in response.tool_calls {
                let result = self
                    .dispatch_tool_call(&req, &call, &mut tool_call_budget)
                    .await;
                self.hub.publish(
                    &req.session_id,
                    Event::new(
                        session.clone(),
                        EventKind::ToolResult,
                        json!({"tool_call_id": call.id, "name": call.name, "result": result}),
                    ),
                );
                self.trace
                    .record(
                        &session,
                        turn,
                        "tool.result",
                        json!({"tool_call_id": call.id, "name": call.name, "result": result}),
                        None,
                    )
                    .await;
                history.push(Message::tool_result(call.id, call.name, result.output));
            }
        }

        self.emit_complete(&req.session_id, &session, turn, truncated).await;
        last_text
    }

    async fn emit_complete(&self, session_id: &SessionKey, session: &str, turn: u64, truncated: bool) {
        self.hub.publish(
            session_id,
            Event::new(session.to_string(), EventKind::Complete, json!({"truncated": truncated})),
        );
        self.trace
            .record(session, turn, "turn.end", json!({"truncated": truncated}), None)
            .await;
    }

    async fn dispatch_tool_call(
        &self,
        req: &TurnRequest<'_>,
        call: &ToolCall,
        tool_call_budget: &mut usize,
    ) -> loom_core::types::ToolResult {
        use loom_core::types::ToolResult;

        if *tool_call_budget == 0 {
            return ToolResult::fail("tool call budget exceeded for this turn");
        }
        *tool_call_budget -= 1;

        if req.mode == PlannerMode::Subagent && call.name == SPAWN_SUBAGENT_TOOL {
            return ToolResult::fail(format!("tool not found: {}", call.name));
        }

        if !self.access.is_allowed(req.role, &call.name) {
            return ToolResult::fail("Permission Denied");
        }

        let Some(tool) = self.tools.get(&call.name) else {
            return ToolResult::fail(format!("tool not found: {}", call.name));
        };

        let mut args = serde_json::Value::Object(call.arguments.clone());
        if call.name == SPAWN_SUBAGENT_TOOL {
            if let Some(obj) = args.as_object_mut() {
                obj.insert("session_id".to_string(), json!(req.session_id.as_str()));
            }
        }

        let call_cancel = req.cancel.child_token();
        let ctx = ToolContext::new(req.session_id.as_str(), call_cancel.clone());
        let deadline = Duration::from_secs(self.config.subagent_timeout_seconds);

        match tokio::time::timeout(deadline, tool.execute(args, &ctx)).await {
            Ok(result) => result,
            Err(_) => {
                call_cancel.cancel();
                ToolResult::fail(format!("timed out after {} seconds", deadline.as_secs()))
            }
        }
    }

    fn build_request(&self, history: &[Message], req: &TurnRequest<'_>) -> LlmRequest {
        let messages: Vec<LlmMessage> = history.iter().map(to_llm_message).collect();
        let messages = validate_and_heal_messages(&messages);

        let tools = if req.mode == PlannerMode::Subagent {
            self.tools
                .get_definitions()
                .into_iter()
                .filter(|t| t.name != SPAWN_SUBAGENT_TOOL)
                .collect()
        } else {
            self.tools.get_definitions()
        };

        LlmRequest {
            model: req.model.to_string(),
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
            max_tokens: Some(8192),
            temperature: None,
            system: Some(req.system_prompt.to_string()),
        }
    }

    /// Drops the oldest entries once `history` exceeds the configured
    /// window. If a summarizer is configured (spec §9 "Summarization of
    /// dropped history"), the dropped slice (and any prior summary already
    /// sitting at the front of history) are folded into a fresh synthetic
    /// system message instead of being discarded outright.
    fn enforce_history_window(&self, history: &mut Vec<Message>) {
        let max = self.config.max_history_messages;
        if history.len() <= max {
            return;
        }

        let Some(summarizer) = &self.config.summarizer else {
            let excess = history.len() - max;
            history.drain(0..excess);
            return;
        };

        let previous_summary = history
            .first()
            .filter(|m| m.role == Role::System && m.content.starts_with(SUMMARY_MARKER))
            .map(|m| m.content[SUMMARY_MARKER.len()..].to_string());
        let had_previous_summary = previous_summary.is_some();

        let start = if had_previous_summary { 1 } else { 0 };
        let excess = history.len() - max;
        // Replacing an existing summary message is a net-zero length change,
        // but inserting a brand new one grows history by one — drop one
        // extra entry up front so the window still lands exactly at `max`.
        let extra = if had_previous_summary { 0 } else { 1 };
        let drop_end = (start + excess + extra).min(history.len());
        let dropped: Vec<Message> = history.drain(start..drop_end).collect();

        let new_summary = summarizer(&dropped, previous_summary.as_deref());
        let summary_message = Message::system(format!("{SUMMARY_MARKER}{new_summary}"));
        if had_previous_summary {
            history[0] = summary_message;
        } else {
            history.insert(0, summary_message);
        }
    }
}

fn to_llm_message(message: &Message) -> LlmMessage {
    match message.role {
        Role::System => LlmMessage {
            role: "user".to_string(),
            content: LlmContent::Text(message.content.clone()),
        },
        Role::User => LlmMessage {
            role: "user".to_string(),
            content: LlmContent::Text(message.content.clone()),
        },
        Role::Assistant => match &message.tool_calls {
            None => LlmMessage {
                role: "assistant".to_string(),
                content: LlmContent::Text(message.content.clone()),
            },
            Some(calls) => {
                let mut blocks = Vec::new();
                if !message.content.is_empty() {
                    blocks.push(ContentBlock::Text {
                        text: message.content.clone(),
                    });
                }
                for call in calls {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: serde_json::Value::Object(call.arguments.clone()),
                    });
                }
                LlmMessage {
                    role: "assistant".to_string(),
                    content: LlmContent::Blocks(blocks),
                }
            }
        },
        Role::Tool => LlmMessage {
            role: "user".to_string(),
            content: LlmContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.content.clone(),
                is_error: None,
            }]),
        },
    }
}

/// Pulls out every `start..end`-delimited segment, returning the segments in
/// order and the remaining text with markers and their contents removed. An
/// unterminated marker is left in the remainder verbatim.
fn extract_thinking(content: &str, start: &str, end: &str) -> (Vec<String>, String) {
    if start.is_empty() {
        return (Vec::new(), content.to_string());
    }
    let mut segments = Vec::new();
    let mut remainder = String::new();
    let mut rest = content;
    while let Some(start_idx) = rest.find(start) {
        remainder.push_str(&rest[..start_idx]);
        let after_start = &rest[start_idx + start.len()..];
        match after_start.find(end) {
            Some(end_idx) => {
                segments.push(after_start[..end_idx].to_string());
                rest = &after_start[end_idx + end.len()..];
            }
            None => {
                remainder.push_str(start);
                rest = after_start;
                break;
            }
        }
    }
    remainder.push_str(rest);
    (segments, remainder)
}
