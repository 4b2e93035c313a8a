//! Meta-agent's task-management tools: `create_task`, `list_tasks`, and a
//! catalog stub for `execute_task` (actually dispatched via the Router's
//! interceptor, never through `Tool::run` — see `router.rs`).

use std::collections::HashMap;
use std::sync::Arc;

use ambit_memory::{MemoryStore, Parameter, TaskConfig, TaskDefinition};
use ambit_tools::{Tool, ToolErrorType, ToolParam, ToolResult, ToolSpec};
use anyhow::Result;
use async_trait::async_trait;

pub struct CreateTaskTool {
    pub memory: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for CreateTaskTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "create_task",
            "Define a reusable task the Router can later spawn a Task-agent to execute.",
            &[
                ToolParam { name: "name".to_string(), description: "Unique task name".to_string(), required: true },
                ToolParam { name: "description".to_string(), description: "Human-readable summary".to_string(), required: true },
                ToolParam {
                    name: "instructions".to_string(),
                    description: "System-prompt template for the Task-agent, with {param} placeholders".to_string(),
                    required: true,
                },
                ToolParam {
                    name: "task_type".to_string(),
                    description: "Free-form task category (default: \"generic\")".to_string(),
                    required: false,
                },
                ToolParam {
                    name: "input_schema".to_string(),
                    description: "JSON array of parameters: [{\"name\",\"description\",\"type\",\"required\",\"default\"}]".to_string(),
                    required: false,
                },
            ],
        )
    }

    async fn run(&self, args: &HashMap<String, String>) -> Result<ToolResult> {
        let Some(name) = args.get("name") else {
            return Ok(ToolResult::err(ToolErrorType::InvalidArgs, "missing required param: name"));
        };
        let Some(description) = args.get("description") else {
            return Ok(ToolResult::err(ToolErrorType::InvalidArgs, "missing required param: description"));
        };
        let Some(instructions) = args.get("instructions") else {
            return Ok(ToolResult::err(ToolErrorType::InvalidArgs, "missing required param: instructions"));
        };
        let task_type = args.get("task_type").cloned().unwrap_or_else(|| "generic".to_string());

        let input_schema: Vec<Parameter> = match args.get("input_schema") {
            Some(raw) if !raw.trim().is_empty() => match serde_json::from_str(raw) {
                Ok(params) => params,
                Err(e) => {
                    return Ok(ToolResult::err(ToolErrorType::InvalidArgs, format!("invalid input_schema: {e}")));
                }
            },
            _ => Vec::new(),
        };

        let config = TaskConfig::new(TaskDefinition {
            name: name.clone(),
            description: description.clone(),
            instructions: instructions.clone(),
            input_schema,
            output_schema: Vec::new(),
            task_type,
        });
        let id = config.id.clone();
        match self.memory.store_task_config(config) {
            Ok(_) => Ok(ToolResult::ok(serde_json::json!({ "task_id": id, "name": name }).to_string())),
            Err(e) => Ok(ToolResult::err(ToolErrorType::ExecutionError, format!("Tool execution failed: {e}"))),
        }
    }
}

pub struct ListTasksTool {
    pub memory: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for ListTasksTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("list_tasks", "List every task definition the Router knows about.", &[])
    }

    async fn run(&self, _args: &HashMap<String, String>) -> Result<ToolResult> {
        match self.memory.list_task_configs() {
            Ok(tasks) => {
                let summaries: Vec<_> = tasks
                    .iter()
                    .map(|t| serde_json::json!({ "task_id": t.id, "name": t.name, "description": t.definition.description }))
                    .collect();
                Ok(ToolResult::ok(serde_json::Value::Array(summaries).to_string()))
            }
            Err(e) => Ok(ToolResult::err(ToolErrorType::ExecutionError, format!("Tool execution failed: {e}"))),
        }
    }
}

/// Registered in the catalog so the Meta-agent's LLM sees `execute_task`
/// alongside its siblings; never actually dispatched here because the
/// Router installs an `Interceptor` for this name that claims every call
/// before the registry is consulted (spec §4.2 step 2, §4.7).
pub struct ExecuteTaskStub;

#[async_trait]
impl Tool for ExecuteTaskStub {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "execute_task",
            "Run a previously defined task as a subordinate Task-agent and return its output.",
            &[
                ToolParam { name: "task_id".to_string(), description: "Id returned by create_task".to_string(), required: true },
            ],
        )
    }

    async fn run(&self, _args: &HashMap<String, String>) -> Result<ToolResult> {
        Ok(ToolResult::err(
            ToolErrorType::ExecutionError,
            "execute_task must be dispatched through the Router interceptor, not the registry",
        ))
    }
}
