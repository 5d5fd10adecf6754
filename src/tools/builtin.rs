//! Built-in tools.
//!
//! `shell` and `write_file` change the outside world, so both ask for
//! confirmation before acting and turn a denial into a plain-text result.
//! `read_file` runs unattended.
//!
//! # Usage
//!
//! ```rust,no_run
//! use turnstile::config::TurnstileConfig;
//! use turnstile::tools::builtin::all_tools;
//!
//! let tools = all_tools(&TurnstileConfig::default());
//! assert_eq!(tools.len(), 3);
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::config::TurnstileConfig;
use crate::error::TurnstileError;
use crate::run::confirmation::{ConfirmationDetail, Decision};
use crate::tools::tool::{AgentTool, Tool, ToolContext};
use crate::tools::types::ToolParameters;
use crate::util::truncate_utf8;

const SHELL_OUTPUT_MAX_BYTES: usize = 32_768;
const READ_FILE_MAX_BYTES: usize = 65_536;

/// Every built-in tool, configured from `config`.
pub fn all_tools(config: &TurnstileConfig) -> Vec<Arc<dyn Tool>> {
    vec![
        shell_tool(config.shell_timeout()),
        read_file_tool(),
        write_file_tool(),
    ]
}

/// Create the `shell` tool: runs a command via `sh -c` once approved.
///
/// Captures stdout and stderr, applies `timeout`, kills the child when the run
/// is cancelled, and truncates output beyond 32 KB.
pub fn shell_tool(timeout: Duration) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "shell",
        "Execute a shell command and return its output",
        ToolParameters::object()
            .string("command", "The shell command to execute", true)
            .string("reason", "Why the command is needed", false)
            .build(),
        move |args, ctx: ToolContext| async move {
            let command = args.get_str("command")?.to_string();
            let decision = ctx
                .request_confirmation(
                    "execute",
                    command.clone(),
                    ConfirmationDetail {
                        tool_name: "shell".into(),
                        tool_args: args.raw().clone(),
                        message: args.get_str_opt("reason").map(str::to_string),
                    },
                )
                .await;
            if let Decision::Denied { reason } = decision {
                return Ok(format!("Command cancelled: {reason}"));
            }

            let child = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .kill_on_drop(true)
                .output();

            let output = tokio::select! {
                _ = ctx.cancellation.cancelled() => {
                    return Ok("Command aborted: run cancelled".to_string());
                }
                result = tokio::time::timeout(timeout, child) => match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => return Err(TurnstileError::tool("shell", e.to_string())),
                    Err(_) => {
                        return Err(TurnstileError::tool(
                            "shell",
                            format!("command timed out after {}ms", timeout.as_millis()),
                        ));
                    }
                },
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut combined = format!("{stdout}{stderr}");
            if combined.len() > SHELL_OUTPUT_MAX_BYTES {
                combined = truncate_utf8(&combined, SHELL_OUTPUT_MAX_BYTES);
                combined.push_str("\n... (truncated)");
            }

            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".into());
            Ok(format!("exit code: {code}\n{combined}"))
        },
    ))
}

/// Create the `read_file` tool: reads a file as UTF-8 text.
pub fn read_file_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "read_file",
        "Read a file's contents as UTF-8 text",
        ToolParameters::object()
            .string("path", "Path to the file to read", true)
            .build(),
        |args, _ctx: ToolContext| async move {
            let path = args.get_str("path")?;

            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| TurnstileError::tool("read_file", format!("{path}: {e}")))?;

            if content.len() > READ_FILE_MAX_BYTES {
                let mut display = truncate_utf8(&content, READ_FILE_MAX_BYTES);
                display.push_str("\n... (truncated)");
                return Ok(display);
            }
            Ok(content)
        },
    ))
}

/// Create the `write_file` tool: writes content to a file once approved.
///
/// Creates parent directories when they do not exist.
pub fn write_file_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "write_file",
        "Write content to a file, creating parent directories if needed",
        ToolParameters::object()
            .string("path", "Path to the file to write", true)
            .string("content", "Content to write to the file", true)
            .build(),
        |args, ctx: ToolContext| async move {
            let path = args.get_str("path")?.to_string();
            let content = args.get_str("content")?.to_string();

            let decision = ctx
                .request_confirmation(
                    "write",
                    path.clone(),
                    ConfirmationDetail {
                        tool_name: "write_file".into(),
                        tool_args: serde_json::json!({ "path": path, "bytes": content.len() }),
                        message: Some(format!("Write {} bytes to {path}", content.len())),
                    },
                )
                .await;
            if let Decision::Denied { reason } = decision {
                return Ok(format!("Write cancelled: {reason}"));
            }

            if let Some(parent) = std::path::Path::new(&path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        TurnstileError::tool(
                            "write_file",
                            format!("failed to create directories for {path}: {e}"),
                        )
                    })?;
                }
            }

            tokio::fs::write(&path, &content)
                .await
                .map_err(|e| TurnstileError::tool("write_file", format!("{path}: {e}")))?;

            Ok(format!("Wrote {} bytes to {path}", content.len()))
        },
    ))
}
