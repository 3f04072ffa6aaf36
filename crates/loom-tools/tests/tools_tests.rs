//! Integration tests for loom-tools: ToolRegistry and all builtin tools
//! against a real (throwaway) filesystem workspace.

use loom_tools::{create_default_registry, new_spawner_handle, ToolContext, ToolRegistry};
use serde_json::json;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

fn test_workspace() -> PathBuf {
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("loom-tools-test-{}-{}", std::process::id(), id));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn cleanup(dir: &std::path::Path) {
    let _ = std::fs::remove_dir_all(dir);
}

fn ctx() -> ToolContext {
    ToolContext::new("s1", CancellationToken::new())
}

fn registry(ws: &std::path::Path) -> ToolRegistry {
    create_default_registry(ws, new_spawner_handle())
}

// ===========================================================================
// ToolRegistry
// ===========================================================================

#[tokio::test]
async fn registry_default_is_empty() {
    let reg = ToolRegistry::new();
    assert!(reg.list().is_empty());
    assert!(reg.get_definitions().is_empty());
}

#[tokio::test]
async fn registry_execute_missing_tool() {
    let reg = ToolRegistry::new();
    let result = reg.execute("nonexistent", json!({}), &ctx()).await;
    assert!(!result.success);
    assert!(result.output.contains("not found"));
}

#[tokio::test]
async fn create_default_registry_has_all_tools() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let names = reg.list();
    assert!(names.contains(&"read"));
    assert!(names.contains(&"write"));
    assert!(names.contains(&"edit"));
    assert!(names.contains(&"bash"));
    assert!(names.contains(&"glob"));
    assert!(names.contains(&"grep"));
    assert!(names.contains(&"spawn_subagent"));
    assert_eq!(names.len(), 7);
    assert_eq!(reg.get_definitions().len(), 7);
    cleanup(&ws);
}

#[tokio::test]
async fn registry_get_tool() {
    let ws = test_workspace();
    let reg = registry(&ws);
    assert!(reg.get("read").is_some());
    assert!(reg.get("nonexistent").is_none());
    cleanup(&ws);
}

#[tokio::test]
async fn registry_tool_has_schema() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let defs = reg.get_definitions();
    for def in &defs {
        assert!(!def.name.is_empty());
        assert!(!def.description.is_empty());
        assert!(def.input_schema.is_object());
    }
    cleanup(&ws);
}

// ===========================================================================
// WriteTool — real filesystem
// ===========================================================================

#[tokio::test]
async fn write_tool_creates_file() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg
        .execute(
            "write",
            json!({"file_path": "test_write.txt", "content": "hello world"}),
            &ctx(),
        )
        .await;
    assert!(result.success, "Write failed: {}", result.output);
    let content = std::fs::read_to_string(ws.join("test_write.txt")).unwrap();
    assert_eq!(content, "hello world");
    cleanup(&ws);
}

#[tokio::test]
async fn write_tool_creates_subdirectories() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg
        .execute(
            "write",
            json!({"file_path": "sub/dir/deep.txt", "content": "nested"}),
            &ctx(),
        )
        .await;
    assert!(result.success);
    assert!(ws.join("sub/dir/deep.txt").exists());
    cleanup(&ws);
}

#[tokio::test]
async fn write_tool_missing_content() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg
        .execute("write", json!({"file_path": "foo.txt"}), &ctx())
        .await;
    assert!(!result.success);
    cleanup(&ws);
}

#[tokio::test]
async fn write_tool_missing_path() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg
        .execute("write", json!({"content": "stuff"}), &ctx())
        .await;
    assert!(!result.success);
    cleanup(&ws);
}

// ===========================================================================
// ReadTool — real filesystem
// ===========================================================================

#[tokio::test]
async fn read_tool_reads_file() {
    let ws = test_workspace();
    std::fs::write(ws.join("readable.txt"), "line1\nline2\nline3").unwrap();
    let reg = registry(&ws);
    let result = reg
        .execute("read", json!({"file_path": "readable.txt"}), &ctx())
        .await;
    assert!(result.success);
    assert!(result.output.contains("line1"));
    assert!(result.output.contains("line3"));
    cleanup(&ws);
}

#[tokio::test]
async fn read_tool_with_offset_and_limit() {
    let ws = test_workspace();
    let lines: Vec<String> = (1..=100).map(|i| format!("line {}", i)).collect();
    std::fs::write(ws.join("big.txt"), lines.join("\n")).unwrap();
    let reg = registry(&ws);

    let result = reg
        .execute(
            "read",
            json!({"file_path": "big.txt", "offset": 10, "limit": 5}),
            &ctx(),
        )
        .await;
    assert!(result.success);
    assert!(result.output.contains("line 10"));
    assert!(result.output.contains("line 14"));
    assert!(!result.output.contains("line 9"));
    assert!(!result.output.contains("line 15"));
    cleanup(&ws);
}

#[tokio::test]
async fn read_tool_missing_file() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg
        .execute("read", json!({"file_path": "nonexistent.txt"}), &ctx())
        .await;
    assert!(!result.success);
    cleanup(&ws);
}

#[tokio::test]
async fn read_tool_missing_path_param() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg.execute("read", json!({}), &ctx()).await;
    assert!(!result.success);
    cleanup(&ws);
}

#[tokio::test]
async fn read_tool_accepts_absolute_path() {
    let ws = test_workspace();
    let target = ws.join("abs.txt");
    std::fs::write(&target, "absolute contents").unwrap();
    let reg = registry(&ws);
    let result = reg
        .execute(
            "read",
            json!({"file_path": target.to_string_lossy()}),
            &ctx(),
        )
        .await;
    assert!(result.success);
    assert!(result.output.contains("absolute contents"));
    cleanup(&ws);
}

// ===========================================================================
// EditTool — real filesystem
// ===========================================================================

#[tokio::test]
async fn edit_tool_replaces_text() {
    let ws = test_workspace();
    std::fs::write(ws.join("editable.txt"), "hello world").unwrap();
    let reg = registry(&ws);
    let result = reg
        .execute(
            "edit",
            json!({"file_path": "editable.txt", "old_string": "world", "new_string": "loom"}),
            &ctx(),
        )
        .await;
    assert!(result.success);
    let content = std::fs::read_to_string(ws.join("editable.txt")).unwrap();
    assert_eq!(content, "hello loom");
    cleanup(&ws);
}

#[tokio::test]
async fn edit_tool_old_string_not_found() {
    let ws = test_workspace();
    std::fs::write(ws.join("edit2.txt"), "hello").unwrap();
    let reg = registry(&ws);
    let result = reg
        .execute(
            "edit",
            json!({"file_path": "edit2.txt", "old_string": "nonexistent", "new_string": "replaced"}),
            &ctx(),
        )
        .await;
    assert!(!result.success);
    assert!(result.output.contains("not found"));
    cleanup(&ws);
}

#[tokio::test]
async fn edit_tool_ambiguous_match_rejected() {
    let ws = test_workspace();
    std::fs::write(ws.join("edit3.txt"), "aa aa aa").unwrap();
    let reg = registry(&ws);
    let result = reg
        .execute(
            "edit",
            json!({"file_path": "edit3.txt", "old_string": "aa", "new_string": "bb"}),
            &ctx(),
        )
        .await;
    assert!(!result.success);
    assert!(result.output.contains("unique"));
    cleanup(&ws);
}

#[tokio::test]
async fn edit_tool_replace_all() {
    let ws = test_workspace();
    std::fs::write(ws.join("edit4.txt"), "aa aa aa").unwrap();
    let reg = registry(&ws);
    let result = reg
        .execute(
            "edit",
            json!({"file_path": "edit4.txt", "old_string": "aa", "new_string": "bb", "replace_all": true}),
            &ctx(),
        )
        .await;
    assert!(result.success);
    assert_eq!(std::fs::read_to_string(ws.join("edit4.txt")).unwrap(), "bb bb bb");
    cleanup(&ws);
}

#[tokio::test]
async fn edit_tool_missing_params() {
    let ws = test_workspace();
    let reg = registry(&ws);
    assert!(
        !reg.execute("edit", json!({"file_path": "f.txt"}), &ctx())
            .await
            .success
    );
    assert!(
        !reg.execute(
            "edit",
            json!({"file_path": "f.txt", "old_string": "x"}),
            &ctx()
        )
        .await
        .success
    );
    cleanup(&ws);
}

// ===========================================================================
// GlobTool / GrepTool — real filesystem
// ===========================================================================

#[tokio::test]
async fn glob_tool_finds_matching_files() {
    let ws = test_workspace();
    std::fs::write(ws.join("a.rs"), "").unwrap();
    std::fs::write(ws.join("b.txt"), "").unwrap();
    let reg = registry(&ws);
    let result = reg.execute("glob", json!({"pattern": "*.rs"}), &ctx()).await;
    assert!(result.success);
    assert!(result.output.contains("a.rs"));
    assert!(!result.output.contains("b.txt"));
    cleanup(&ws);
}

#[tokio::test]
async fn glob_tool_no_matches() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg
        .execute("glob", json!({"pattern": "*.nonexistent"}), &ctx())
        .await;
    assert!(result.success);
    assert_eq!(result.output, "No files found");
    cleanup(&ws);
}

#[tokio::test]
async fn grep_tool_finds_matching_file() {
    let ws = test_workspace();
    std::fs::write(ws.join("needle.txt"), "the needle is here").unwrap();
    std::fs::write(ws.join("other.txt"), "nothing to see").unwrap();
    let reg = registry(&ws);
    let result = reg
        .execute("grep", json!({"pattern": "needle"}), &ctx())
        .await;
    assert!(result.success);
    assert!(result.output.contains("needle.txt"));
    assert!(!result.output.contains("other.txt"));
    cleanup(&ws);
}

#[tokio::test]
async fn grep_tool_content_mode_returns_lines() {
    let ws = test_workspace();
    std::fs::write(ws.join("lines.txt"), "alpha\nbeta\ngamma").unwrap();
    let reg = registry(&ws);
    let result = reg
        .execute(
            "grep",
            json!({"pattern": "beta", "output_mode": "content"}),
            &ctx(),
        )
        .await;
    assert!(result.success);
    assert!(result.output.contains("beta"));
    cleanup(&ws);
}

#[tokio::test]
async fn grep_tool_invalid_regex_fails() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg.execute("grep", json!({"pattern": "("}), &ctx()).await;
    assert!(!result.success);
    cleanup(&ws);
}

// ===========================================================================
// BashTool — real commands
// ===========================================================================

#[tokio::test]
async fn bash_tool_runs_command() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg
        .execute("bash", json!({"command": "echo hello"}), &ctx())
        .await;
    assert!(result.success);
    assert_eq!(result.output, "hello");
    cleanup(&ws);
}

#[tokio::test]
async fn bash_tool_captures_exit_code() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg
        .execute("bash", json!({"command": "exit 42"}), &ctx())
        .await;
    assert!(!result.success);
    assert!(result.output.contains("42"), "{}", result.output);
    cleanup(&ws);
}

#[tokio::test]
async fn bash_tool_captures_stderr() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg
        .execute("bash", json!({"command": "echo err >&2"}), &ctx())
        .await;
    assert!(result.output.contains("err"));
    cleanup(&ws);
}

#[tokio::test]
async fn bash_tool_runs_in_workspace() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg.execute("bash", json!({"command": "pwd"}), &ctx()).await;
    assert!(result.output.contains(&ws.to_string_lossy().to_string()));
    cleanup(&ws);
}

#[tokio::test]
async fn bash_tool_timeout() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg
        .execute("bash", json!({"command": "sleep 60", "timeout": 1}), &ctx())
        .await;
    assert!(!result.success);
    assert!(result.output.contains("timed out"));
    cleanup(&ws);
}

#[tokio::test]
async fn bash_tool_missing_command() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg.execute("bash", json!({}), &ctx()).await;
    assert!(!result.success);
    cleanup(&ws);
}

#[tokio::test]
async fn bash_tool_empty_output() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg.execute("bash", json!({"command": "true"}), &ctx()).await;
    assert!(result.success);
    assert_eq!(result.output, "(no output)");
    cleanup(&ws);
}

#[tokio::test]
async fn bash_tool_cancellation_kills_child() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let cancel = CancellationToken::new();
    let c = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        c.cancel();
    });
    let ctx = ToolContext::new("s1", cancel);
    let result = reg
        .execute("bash", json!({"command": "sleep 60"}), &ctx)
        .await;
    assert!(!result.success);
    assert_eq!(result.output, "cancelled");
    cleanup(&ws);
}

// ===========================================================================
// SpawnSubagentTool — unwired handle
// ===========================================================================

#[tokio::test]
async fn spawn_subagent_fails_without_runtime_wired() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg
        .execute("spawn_subagent", json!({"task": "investigate the bug"}), &ctx())
        .await;
    assert!(!result.success);
    assert!(result.output.contains("not initialized"));
    cleanup(&ws);
}

#[tokio::test]
async fn spawn_subagent_requires_task() {
    let ws = test_workspace();
    let reg = registry(&ws);
    let result = reg.execute("spawn_subagent", json!({}), &ctx()).await;
    assert!(!result.success);
    cleanup(&ws);
}

// ===========================================================================
// End-to-end: write then read then edit then read
// ===========================================================================

#[tokio::test]
async fn write_read_edit_read_cycle() {
    let ws = test_workspace();
    let reg = registry(&ws);

    let r = reg
        .execute(
            "write",
            json!({"file_path": "cycle.txt", "content": "alpha beta gamma"}),
            &ctx(),
        )
        .await;
    assert!(r.success);

    let r = reg
        .execute("read", json!({"file_path": "cycle.txt"}), &ctx())
        .await;
    assert!(r.output.contains("alpha beta gamma"));

    let r = reg
        .execute(
            "edit",
            json!({"file_path": "cycle.txt", "old_string": "beta", "new_string": "BETA"}),
            &ctx(),
        )
        .await;
    assert!(r.success);

    let r = reg
        .execute("read", json!({"file_path": "cycle.txt"}), &ctx())
        .await;
    assert!(r.output.contains("alpha BETA gamma"));

    cleanup(&ws);
}
