use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Tool descriptor ──────────────────────────────────────────────────────────

/// Describes a single parameter a tool accepts.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Static metadata about a tool, surfaced to the LLM so it can decide which
/// tool to call (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    /// Build a `ToolSpec` from a flat param list, rendering `input_schema` as
    /// a JSON-schema object (the shape every tool consumer in this stack
    /// already expects: `{"type": "object", "properties": {...}, "required": [...]}`).
    pub fn new(name: impl Into<String>, description: impl Into<String>, params: &[ToolParam]) -> Self {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in params {
            properties.insert(
                p.name.clone(),
                serde_json::json!({"type": "string", "description": p.description}),
            );
            if p.required {
                required.push(p.name.clone());
            }
        }
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

/// Error classification surfaced on a failed [`ToolResult`] (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorType {
    ExecutionError,
    LoopDetected,
    ResourceLimit,
    UserRejected,
    InvalidArgs,
    PermissionDenied,
}

/// The result of dispatching a single tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    /// LLM-visible content fed back into the conversation.
    pub content: String,
    /// Optional richer rendering for a human-facing surface.
    pub user_display: Option<String>,
    pub error: Option<String>,
    pub error_type: Option<ToolErrorType>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            user_display: None,
            error: None,
            error_type: None,
        }
    }

    pub fn err(error_type: ToolErrorType, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            content: error.clone(),
            user_display: None,
            error: Some(error),
            error_type: Some(error_type),
        }
    }
}

/// Trait implemented by every in-process tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolResult>;
}

/// Central catalog of in-process tools (spec §4.2 "C2").
///
/// Subprocess-hosted tools (§4.3) are merged into the same logical catalog
/// one layer up, in `ambit-exec`, which owns both this registry and the
/// tool-server supervisor.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    disabled_tools: HashSet<String>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn disable(&mut self, name: impl Into<String>) {
        self.disabled_tools.insert(name.into());
    }

    pub fn enable(&mut self, name: &str) {
        self.disabled_tools.remove(name);
    }

    pub fn is_globally_disabled(&self, name: &str) -> bool {
        self.disabled_tools.contains(name)
    }

    /// Tool descriptors visible to a given caller, honoring both the global
    /// disabled set and a caller-specific one.
    pub fn list_tools(&self, caller_disabled: &HashSet<String>) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| t.spec())
            .filter(|s| !self.disabled_tools.contains(&s.name) && !caller_disabled.contains(&s.name))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.spec().name == name)
            .map(|t| t.as_ref())
    }
}

// ── Built-in tools ───────────────────────────────────────────────────────────

pub mod builtins;
pub use builtins::{ReadFileTool, RunShellTool, WriteFileTool};

// ── ToolRegistry tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod registry_tests {
    use super::*;

    struct DummyTool {
        name: String,
    }

    #[async_trait]
    impl Tool for DummyTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new(
                &self.name,
                format!("Dummy tool: {}", self.name),
                &[ToolParam {
                    name: "input".to_string(),
                    description: "test param".to_string(),
                    required: true,
                }],
            )
        }
        async fn run(&self, _args: &HashMap<String, String>) -> Result<ToolResult> {
            Ok(ToolResult::ok(format!("ran {}", self.name)))
        }
    }

    #[test]
    fn empty_registry() {
        let reg = ToolRegistry::default();
        assert!(reg.list_tools(&HashSet::new()).is_empty());
        assert!(reg.get("anything").is_none());
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "alpha".into() }));
        reg.register(Box::new(DummyTool { name: "beta".into() }));

        assert!(reg.get("alpha").is_some());
        assert!(reg.get("beta").is_some());
        assert!(reg.get("gamma").is_none());
    }

    #[test]
    fn list_tools_returns_all_when_nothing_disabled() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "one".into() }));
        reg.register(Box::new(DummyTool { name: "two".into() }));

        let specs = reg.list_tools(&HashSet::new());
        assert_eq!(specs.len(), 2);
    }

    #[test]
    fn global_disable_hides_from_every_caller() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "record_memory".into() }));
        reg.disable("record_memory");

        assert!(reg.list_tools(&HashSet::new()).is_empty());
    }

    #[test]
    fn per_caller_disable_only_hides_for_that_caller() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "shared".into() }));

        let mut caller_disabled = HashSet::new();
        caller_disabled.insert("shared".to_string());

        assert!(reg.list_tools(&caller_disabled).is_empty());
        assert!(!reg.list_tools(&HashSet::new()).is_empty());
    }

    #[tokio::test]
    async fn run_registered_tool() {
        let mut reg = ToolRegistry::default();
        reg.register(Box::new(DummyTool { name: "runner".into() }));

        let tool = reg.get("runner").unwrap();
        let result = tool.run(&HashMap::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.content, "ran runner");
    }

    #[test]
    fn tool_spec_input_schema_lists_required_params() {
        let spec = ToolSpec::new(
            "x",
            "desc",
            &[
                ToolParam { name: "a".into(), description: "d".into(), required: true },
                ToolParam { name: "b".into(), description: "d".into(), required: false },
            ],
        );
        let required = spec.input_schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0], "a");
    }
}
