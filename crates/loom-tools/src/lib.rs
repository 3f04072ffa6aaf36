//! Concrete tool implementations and the registry that exposes them to the
//! Planner Loop. Each tool is a self-contained file in `src/tools/`.

pub mod registry;
pub mod tools;

pub use registry::{Tool, ToolContext, ToolRegistry};
pub use tools::spawn::{new_spawner_handle, SpawnSubagentTool, SpawnerHandle, SubagentSpawner};

use std::path::Path;

/// Builds the registry with every concrete tool wired in, including
/// `spawn_subagent` bound to the given spawner handle. The handle starts
/// empty (`None`) and is expected to be filled in once the owning runtime
/// (in `loom-agent`) has constructed itself — see `new_spawner_handle`.
pub fn create_default_registry(
    workspace_root: impl AsRef<Path>,
    spawner: SpawnerHandle,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let root = workspace_root.as_ref();

    registry.register(tools::read::ReadTool::new(root));
    registry.register(tools::glob::GlobTool::new(root));
    registry.register(tools::grep::GrepTool::new(root));
    registry.register(tools::write::WriteTool::new(root));
    registry.register(tools::edit::EditTool::new(root));
    registry.register(tools::bash::BashTool::new(root));
    registry.register(SpawnSubagentTool::new(spawner));

    registry
}

/// A policy-scoped registry containing only the named tools — used when a
/// role's allow-list should be enforced at registration time rather than
/// per-call (the per-call matcher in `loom-agent` is the primary mechanism;
/// this is for building a deliberately narrower registry, e.g. for a
/// subagent persona that should never see `spawn_subagent` at all).
pub fn create_policy_registry(
    workspace_root: impl AsRef<Path>,
    allowed_tools: &[&str],
    spawner: SpawnerHandle,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let root = workspace_root.as_ref();

    for name in allowed_tools {
        match *name {
            "read" => registry.register(tools::read::ReadTool::new(root)),
            "glob" => registry.register(tools::glob::GlobTool::new(root)),
            "grep" => registry.register(tools::grep::GrepTool::new(root)),
            "write" => registry.register(tools::write::WriteTool::new(root)),
            "edit" => registry.register(tools::edit::EditTool::new(root)),
            "bash" => registry.register(tools::bash::BashTool::new(root)),
            "spawn_subagent" => registry.register(SpawnSubagentTool::new(spawner.clone())),
            other => tracing::warn!("unknown tool in policy: {}", other),
        }
    }

    registry
}
