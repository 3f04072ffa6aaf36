//! `spawn_subagent` — the reserved tool through which a Planner turn fans
//! out work to the Concurrency Lane (spec C3/C4/C7).
//!
//! The tool itself never runs a child turn. It holds a factory handle set
//! after the agent runtime is constructed — this breaks the circular
//! dependency the source observes (the Planner needs the tool, the tool
//! needs a nested-Planner factory that only the Planner's owner can build;
//! see spec §9). Registering a run and handing the job to the lane happens
//! synchronously in the injected implementation, so this call returns with a
//! `run_id` before the child has executed a single turn.

use crate::registry::{Tool, ToolContext};
use loom_core::types::ToolResult;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared handle to whatever implements subagent spawning, set once the
/// owning runtime has constructed itself.
pub type SpawnerHandle = Arc<RwLock<Option<Arc<dyn SubagentSpawner>>>>;

/// Implemented by the component that owns the Subagent Registry and
/// Concurrency Lane (in `loom-agent`). Decouples the tool layer from the
/// concrete runtime type.
#[async_trait::async_trait]
pub trait SubagentSpawner: Send + Sync {
    /// Registers a run for `parent_session_id` and submits it to the
    /// Concurrency Lane. Returns the assigned `run_id` immediately; the run
    /// executes and transitions asynchronously and is observed via the
    /// Registry/Hub, never through this call's return value.
    async fn spawn(&self, parent_session_id: &str, task: &str, label: &str) -> String;
}

pub struct SpawnSubagentTool {
    spawner: SpawnerHandle,
}

impl SpawnSubagentTool {
    pub fn new(spawner: SpawnerHandle) -> Self {
        Self { spawner }
    }
}

pub fn new_spawner_handle() -> SpawnerHandle {
    Arc::new(RwLock::new(None))
}

#[async_trait::async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Spawn a subagent to work on a scoped task concurrently. Returns immediately \
         with a run id; the subagent's progress and result arrive as agent.registered / \
         agent.updated events, and can be polled via the subagents listing."
    }

    fn prompt(&self) -> &str {
        "Use spawn_subagent for work that can proceed independently of this turn. \
         Give it a clear, self-contained task — the subagent does not see this \
         conversation's history, only the task text you provide."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["task"],
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The self-contained task for the subagent to perform."
                },
                "label": {
                    "type": "string",
                    "description": "Short human-readable tag for this run (default: derived from task)."
                }
            }
        })
    }

    /// `session_id` arrives already injected by the Planner (spec §4.7); a
    /// request missing it indicates a wiring bug, not a client error, so it
    /// fails loudly rather than falling back to a guessed session.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let task = match args.get("task").and_then(|v| v.as_str()) {
            Some(t) if !t.trim().is_empty() => t,
            _ => return ToolResult::fail("'task' is required"),
        };
        let label = args
            .get("label")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| task.chars().take(40).collect());

        let spawner = {
            let guard = self.spawner.read().await;
            match guard.as_ref() {
                Some(s) => s.clone(),
                None => {
                    return ToolResult::fail(
                        "spawn_subagent is unavailable: runtime not initialized",
                    )
                }
            }
        };

        let run_id = spawner.spawn(&ctx.session_id, task, &label).await;
        ToolResult::ok_with_data(
            format!("subagent spawned: run_id={run_id}"),
            json!({ "run_id": run_id, "label": label }),
        )
    }
}
