//! Shell execution tool.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::{Tool, ToolErrorType, ToolParam, ToolResult, ToolSpec};

use super::fs::truncate_byte_boundary;

pub struct RunShellTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for RunShellTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "run_shell",
            "Execute a shell command within the workspace directory. \
            Each invocation runs in a fresh shell — `cd` does not persist \
            between calls. Chain commands with `&&` if you need them to \
            share working directory or state.",
            &[
                ToolParam {
                    name: "command".to_string(),
                    description: "Shell command to execute".to_string(),
                    required: true,
                },
                ToolParam {
                    name: "timeout_secs".to_string(),
                    description: "Max execution time in seconds (default: 30)".to_string(),
                    required: false,
                },
            ],
        )
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolResult> {
        let Some(command) = args.get("command") else {
            return Ok(ToolResult::err(
                ToolErrorType::InvalidArgs,
                "missing required param: command",
            ));
        };
        let timeout_secs: u64 = args
            .get("timeout_secs")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(&self.workspace_root)
                .output(),
        )
        .await
        {
            Err(_) => {
                return Ok(ToolResult::err(
                    ToolErrorType::ResourceLimit,
                    format!("command timed out after {timeout_secs}s"),
                ));
            }
            Ok(inner) => inner?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{stdout}\n[stderr] {stderr}")
        };

        let max_output = 32768;
        let result = if combined.len() > max_output {
            let end = truncate_byte_boundary(&combined, max_output);
            format!("{}…[truncated at {} bytes]", &combined[..end], max_output)
        } else {
            combined
        };

        if output.status.success() {
            Ok(ToolResult::ok(result))
        } else {
            Ok(ToolResult::err(ToolErrorType::ExecutionError, result))
        }
    }
}
