//! File system tools: read and write files, confined to a workspace root.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::{Tool, ToolErrorType, ToolParam, ToolResult, ToolSpec};

/// Find the largest byte offset <= `max` that falls on a UTF-8 character
/// boundary. Safe to use as `&s[..truncate_byte_boundary(s, max)]`.
pub(super) fn truncate_byte_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

pub struct ReadFileTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "read_file",
            "Read the contents of a file within the workspace.",
            &[
                ToolParam {
                    name: "path".to_string(),
                    description: "Relative path from workspace root".to_string(),
                    required: true,
                },
                ToolParam {
                    name: "max_bytes".to_string(),
                    description: "Maximum bytes to read (default: 65536)".to_string(),
                    required: false,
                },
            ],
        )
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolResult> {
        let Some(rel_path) = args.get("path") else {
            return Ok(ToolResult::err(
                ToolErrorType::InvalidArgs,
                "missing required param: path",
            ));
        };

        let full = self.workspace_root.join(rel_path);
        let canonical = match full.canonicalize() {
            Ok(c) => c,
            Err(e) => {
                return Ok(ToolResult::err(
                    ToolErrorType::ExecutionError,
                    format!("cannot resolve path '{rel_path}': {e}"),
                ));
            }
        };

        let root_canonical = self.workspace_root.canonicalize()?;
        if !canonical.starts_with(&root_canonical) {
            return Ok(ToolResult::err(
                ToolErrorType::PermissionDenied,
                format!("path escapes workspace boundary: {}", canonical.display()),
            ));
        }

        let max_bytes: usize = args
            .get("max_bytes")
            .and_then(|v| v.parse().ok())
            .unwrap_or(65536);

        let content = std::fs::read_to_string(&canonical)?;
        let truncated = if content.len() > max_bytes {
            let end = truncate_byte_boundary(&content, max_bytes);
            format!("{}…[truncated at {} bytes]", &content[..end], max_bytes)
        } else {
            content
        };

        Ok(ToolResult::ok(truncated))
    }
}

pub struct WriteFileTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "write_file",
            "Write content to a file within the workspace (creates or overwrites).",
            &[
                ToolParam {
                    name: "path".to_string(),
                    description: "Relative path from workspace root".to_string(),
                    required: true,
                },
                ToolParam {
                    name: "content".to_string(),
                    description: "File content to write".to_string(),
                    required: true,
                },
            ],
        )
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolResult> {
        let Some(rel_path) = args.get("path") else {
            return Ok(ToolResult::err(
                ToolErrorType::InvalidArgs,
                "missing required param: path",
            ));
        };
        let Some(content) = args.get("content") else {
            return Ok(ToolResult::err(
                ToolErrorType::InvalidArgs,
                "missing required param: content",
            ));
        };

        let full = self.workspace_root.join(rel_path);
        let root_canonical = self.workspace_root.canonicalize()?;

        if let Ok(canonical) = full.canonicalize() {
            if !canonical.starts_with(&root_canonical) {
                return Ok(ToolResult::err(
                    ToolErrorType::PermissionDenied,
                    format!("path escapes workspace boundary: {}", canonical.display()),
                ));
            }
        } else {
            let Some(parent) = full.parent() else {
                return Ok(ToolResult::err(ToolErrorType::InvalidArgs, "invalid path"));
            };
            std::fs::create_dir_all(parent)?;
            let parent_canonical = parent.canonicalize()?;
            if !parent_canonical.starts_with(&root_canonical) {
                return Ok(ToolResult::err(
                    ToolErrorType::PermissionDenied,
                    format!("parent escapes workspace boundary: {}", parent_canonical.display()),
                ));
            }
        }

        std::fs::write(&full, content)?;
        Ok(ToolResult::ok(format!(
            "wrote {} bytes to {}",
            content.len(),
            rel_path
        )))
    }
}
