//! Bash tool — execute shell commands with timeout and cancellation.

use crate::registry::{Tool, ToolContext};
use loom_core::types::ToolResult;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

pub struct BashTool {
    workspace_root: PathBuf,
    default_timeout_secs: u64,
}

impl BashTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            default_timeout_secs: 120,
        }
    }
}

#[async_trait::async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a bash command. Use for git, npm, docker, system commands. \
         Captures stdout and stderr. Set timeout in seconds (default 120). \
         Include a short description of what the command does."
    }

    fn prompt(&self) -> &str {
        "Use the bash tool for terminal operations. Quote paths with spaces. \
         Prefer dedicated tools (read, write, edit, glob, grep) over bash equivalents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 120, max 600)"
                },
                "description": {
                    "type": "string",
                    "description": "Short description of what this command does"
                }
            },
            "required": ["command"]
        })
    }

    /// Spawns the process with `kill_on_drop(true)` and races against the
    /// deadline and `ctx.cancel`. On either, the child process is killed
    /// immediately rather than left to exit on its own.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        let command = match args["command"].as_str() {
            Some(c) => c,
            None => return ToolResult::fail("missing required parameter: command"),
        };

        let timeout_secs = args["timeout"]
            .as_u64()
            .unwrap_or(self.default_timeout_secs)
            .min(600);

        if let Some(desc) = args["description"].as_str() {
            debug!("bash [{}]: {}", desc, command);
        } else {
            debug!("bash: {}", &command[..command.len().min(80)]);
        }

        let mut child = match Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace_root)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ToolResult::fail(format!("failed to spawn: {e}")),
        };

        let timeout_duration = std::time::Duration::from_secs(timeout_secs);
        let cancel = ctx.cancel.clone();

        tokio::select! {
            result = tokio::time::timeout(timeout_duration, child.wait()) => {
                match result {
                    Ok(Ok(status)) => {
                        let stdout = read_pipe(child.stdout.take()).await;
                        let stderr = read_pipe(child.stderr.take()).await;
                        let output = std::process::Output {
                            status,
                            stdout: stdout.into_bytes(),
                            stderr: stderr.into_bytes(),
                        };
                        format_output(&output)
                    }
                    Ok(Err(e)) => ToolResult::fail(format!("failed to wait: {e}")),
                    Err(_) => {
                        let _ = child.kill().await;
                        ToolResult::fail(format!("timed out after {timeout_secs} seconds"))
                    }
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                ToolResult::fail("cancelled")
            }
        }
    }
}

/// Read all bytes from an optional child pipe into a string.
async fn read_pipe(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    use tokio::io::AsyncReadExt;
    match pipe {
        Some(mut p) => {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).to_string()
        }
        None => String::new(),
    }
}

fn format_output(output: &std::process::Output) -> ToolResult {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    let result = if output.status.success() {
        if stderr.is_empty() {
            stdout.trim().to_string()
        } else {
            format!("{}\n{}", stdout.trim(), stderr.trim())
        }
    } else {
        format!(
            "Exit code: {}\n{}\n{}",
            output.status.code().unwrap_or(-1),
            stdout.trim(),
            stderr.trim()
        )
    };

    if result.is_empty() {
        ToolResult::ok("(no output)")
    } else if result.len() > 30000 {
        ToolResult::ok(format!(
            "{}\n... [truncated, {} total chars]",
            &result[..30000],
            result.len()
        ))
    } else if output.status.success() {
        ToolResult::ok(result)
    } else {
        ToolResult::fail(result)
    }
}
