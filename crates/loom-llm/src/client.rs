//! The LLM Client Contract (spec C2): a single `generate` call that
//! normalizes any provider's streaming wire format into one vocabulary the
//! Planner Loop understands. Failures are returned as `finish_reason=error`
//! with `content` populated — never raised — so the Planner can treat a
//! dead provider exactly like any other turn outcome.

use crate::provider::{LlmProvider, LlmResult, LlmStream};
use crate::types::{AccumulatedToolCall, LlmRequest, StreamDelta, Usage};
use futures::StreamExt;
use loom_core::types::ToolCall;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default delimiters the source uses to mark thinking segments inside
/// assistant text. Configurable by callers that build a different
/// `ThinkingMarkers`, but this is the literal pair a faithful port defaults
/// to (see spec §9, "Thinking markers").
pub const DEFAULT_THINKING_START: &str = "<thinking>";
pub const DEFAULT_THINKING_END: &str = "</thinking>";

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Error,
    Length,
}

/// The normalized response shape every `LlmClient` implementation returns.
#[derive(Clone, Debug)]
pub struct LlmResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl LlmResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: Some(message.into()),
            tool_calls: Vec::new(),
            finish_reason: FinishReason::Error,
            usage: Usage::default(),
        }
    }
}

#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResponse;
}

/// Adapts a streaming [`LlmProvider`] to the non-streaming [`LlmClient`]
/// contract by draining its stream into one aggregated response.
pub struct AnthropicClient {
    provider: crate::anthropic::AnthropicProvider,
}

impl AnthropicClient {
    pub fn new(provider: crate::anthropic::AnthropicProvider) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn generate(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResponse {
        let stream: LlmResult<_> = self.provider.complete_stream(request, cancel).await;
        let stream = match stream {
            Ok(s) => s,
            Err(e) => return LlmResponse::error(e.to_string()),
        };
        drain_stream(stream).await
    }
}

async fn drain_stream(stream: LlmStream) -> LlmResponse {
    tokio::pin!(stream);

    let mut text = String::new();
    let mut thinking = String::new();
    let mut calls: Vec<AccumulatedToolCall> = Vec::new();
    let mut usage = Usage::default();
    let mut stop_reason: Option<String> = None;

    while let Some(item) = stream.next().await {
        match item {
            Ok(StreamDelta::Text(t)) => text.push_str(&t),
            Ok(StreamDelta::Thinking(t)) => thinking.push_str(&t),
            Ok(StreamDelta::ToolCallStart { id, name }) => {
                calls.push(AccumulatedToolCall {
                    id,
                    name,
                    arguments: String::new(),
                });
            }
            Ok(StreamDelta::ToolCallDelta { id, arguments }) => {
                if let Some(c) = calls.iter_mut().find(|c| c.id == id) {
                    c.arguments.push_str(&arguments);
                }
            }
            Ok(StreamDelta::ToolCallEnd { .. }) => {}
            Ok(StreamDelta::Done {
                stop_reason: sr,
                usage: u,
            }) => {
                stop_reason = sr;
                if let Some(u) = u {
                    usage = u;
                }
            }
            Ok(StreamDelta::Error(e)) => return LlmResponse::error(e),
            Err(e) => return LlmResponse::error(e.to_string()),
        }
    }

    let tool_calls: Vec<ToolCall> = calls
        .into_iter()
        .map(|c| {
            let arguments = c
                .parse_arguments()
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default();
            ToolCall {
                id: c.id,
                name: c.name,
                arguments,
            }
        })
        .collect();

    let finish_reason = if !tool_calls.is_empty() {
        FinishReason::ToolCalls
    } else if stop_reason.as_deref() == Some("max_tokens") {
        FinishReason::Length
    } else {
        FinishReason::Stop
    };

    let content = if !thinking.is_empty() {
        Some(format!(
            "{DEFAULT_THINKING_START}{thinking}{DEFAULT_THINKING_END}{text}"
        ))
    } else if text.is_empty() && tool_calls.is_empty() {
        None
    } else {
        Some(text)
    };

    LlmResponse {
        content,
        tool_calls,
        finish_reason,
        usage,
    }
}

/// Records one fallback attempt. Implemented by the Trace Sink so
/// `loom-llm` never needs to depend on `loom-agent`.
#[async_trait::async_trait]
pub trait AttemptSink: Send + Sync {
    async fn record_attempt(&self, provider: &str, outcome: &str);
}

/// Wraps an ordered list of candidate clients (spec §9 "Provider
/// fallback"). On a retryable error the next candidate is tried; on a
/// non-retryable error or success the current response is returned as-is.
pub struct FallbackClient {
    candidates: Vec<Arc<dyn LlmClient>>,
    retryable_markers: Vec<String>,
    sink: Option<Arc<dyn AttemptSink>>,
}

impl FallbackClient {
    pub fn new(candidates: Vec<Arc<dyn LlmClient>>) -> Self {
        Self {
            candidates,
            retryable_markers: default_retryable_markers(),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AttemptSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_retryable_markers(mut self, markers: Vec<String>) -> Self {
        self.retryable_markers = markers;
        self
    }

    fn is_retryable(&self, message: &str) -> bool {
        let lower = message.to_ascii_lowercase();
        self.retryable_markers
            .iter()
            .any(|marker| lower.contains(marker.as_str()))
    }
}

fn default_retryable_markers() -> Vec<String> {
    [
        "rate limit",
        "429",
        "timeout",
        "timed out",
        "overloaded",
        "503",
        "502",
        "500",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[async_trait::async_trait]
impl LlmClient for FallbackClient {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn generate(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResponse {
        let mut last = LlmResponse::error("no candidates configured");
        for candidate in &self.candidates {
            let response = candidate.generate(request.clone(), cancel.clone()).await;
            if let Some(sink) = &self.sink {
                let outcome = match response.finish_reason {
                    FinishReason::Error => {
                        format!("error: {}", response.content.as_deref().unwrap_or(""))
                    }
                    other => format!("{other:?}"),
                };
                sink.record_attempt(candidate.name(), &outcome).await;
            }
            if response.finish_reason != FinishReason::Error {
                return response;
            }
            let retryable = self.is_retryable(response.content.as_deref().unwrap_or(""));
            last = response;
            if !retryable {
                break;
            }
        }
        last
    }
}
