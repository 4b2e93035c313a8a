//! Tool Registry & Executor (spec §4.2, "C2"): merges in-process tools with
//! subprocess-hosted ones into one dispatch path, with an interceptor
//! mechanism for rerouting selected tool calls (e.g. `execute_task`).

pub mod toolserver;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ambit_tools::{Tool, ToolErrorType, ToolRegistry, ToolResult, ToolSpec};
use async_trait::async_trait;
use serde_json::Value;

use toolserver::ToolServerSupervisor;

/// Hook that reroutes a tool call instead of dispatching it normally (spec
/// §4.2: "this is how `execute_task` is routed to a Task-agent").
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Returning `None` falls through to normal dispatch.
    async fn intercept(&self, args: &HashMap<String, String>) -> Option<ToolResult>;
}

/// Orchestrates tool invocation across the in-process registry, registered
/// interceptors, and subprocess tool-servers.
pub struct ToolExecutor {
    registry: ToolRegistry,
    supervisor: Option<Arc<ToolServerSupervisor>>,
    interceptors: HashMap<String, Box<dyn Interceptor>>,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            supervisor: None,
            interceptors: HashMap::new(),
        }
    }

    pub fn with_supervisor(mut self, supervisor: Arc<ToolServerSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn set_interceptor(&mut self, tool_name: impl Into<String>, interceptor: Box<dyn Interceptor>) {
        self.interceptors.insert(tool_name.into(), interceptor);
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    /// The catalog visible to a given caller: in-process tools plus whatever
    /// the subprocess supervisor currently reports as running, minus global
    /// and per-caller disabled sets.
    pub async fn list_tools(&self, caller_disabled: &HashSet<String>) -> Vec<ToolSpec> {
        let mut specs = self.registry.list_tools(caller_disabled);
        if let Some(supervisor) = &self.supervisor {
            for (_, tool) in supervisor.list_tools().await {
                if self.registry.is_globally_disabled(&tool.name) || caller_disabled.contains(&tool.name) {
                    continue;
                }
                specs.push(ToolSpec {
                    name: tool.name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
            }
        }
        specs
    }

    /// Dispatch algorithm (spec §4.2):
    /// 1. Globally-disabled tool names are rejected before anything else.
    /// 2. A registered interceptor, if any, can claim the call outright.
    /// 3. Otherwise dispatch in-process.
    /// 4. Otherwise forward to the owning subprocess tool-server.
    /// 5. Any failure surfaced along the way is wrapped as `execution_error`.
    pub async fn execute(
        &self,
        tool_name: &str,
        args: &HashMap<String, String>,
        caller_disabled: &HashSet<String>,
    ) -> ToolResult {
        if self.registry.is_globally_disabled(tool_name) || caller_disabled.contains(tool_name) {
            return ToolResult::err(
                ToolErrorType::PermissionDenied,
                format!("tool '{tool_name}' is disabled"),
            );
        }

        if let Some(interceptor) = self.interceptors.get(tool_name) {
            if let Some(result) = interceptor.intercept(args).await {
                return result;
            }
        }

        if let Some(tool) = self.registry.get(tool_name) {
            if let Some(missing) = missing_required_arg(&tool.spec(), args) {
                return ToolResult::err(
                    ToolErrorType::InvalidArgs,
                    format!("missing required param: {missing}"),
                );
            }
            return match tool.run(args).await {
                Ok(result) => result,
                Err(e) => ToolResult::err(ToolErrorType::ExecutionError, format!("Tool execution failed: {e}")),
            };
        }

        if let Some(supervisor) = &self.supervisor {
            let owner = supervisor
                .list_tools()
                .await
                .into_iter()
                .find(|(_, t)| t.name == tool_name)
                .map(|(server_id, _)| server_id);

            if let Some(server_id) = owner {
                let arguments: Value = args
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect::<serde_json::Map<_, _>>()
                    .into();
                return match supervisor.call_tool(&server_id, tool_name, arguments).await {
                    Ok(result) => {
                        let content = result
                            .content
                            .into_iter()
                            .map(|c| c.text)
                            .collect::<Vec<_>>()
                            .join("\n");
                        if result.is_error {
                            ToolResult::err(ToolErrorType::ExecutionError, content)
                        } else {
                            ToolResult::ok(content)
                        }
                    }
                    Err(e) => ToolResult::err(ToolErrorType::ExecutionError, format!("Tool execution failed: {e}")),
                };
            }
        }

        ToolResult::err(
            ToolErrorType::InvalidArgs,
            format!("unknown tool: {tool_name}"),
        )
    }
}

/// Checks `args` against the tool's declared `required` schema fields,
/// returning the name of the first one missing (spec §4.2 step 3:
/// "validate the arguments against the schema").
fn missing_required_arg(spec: &ToolSpec, args: &HashMap<String, String>) -> Option<String> {
    let required = spec.input_schema.get("required")?.as_array()?;
    required
        .iter()
        .filter_map(|v| v.as_str())
        .find(|name| !args.contains_key(*name))
        .map(str::to_string)
}

// ── Workspace boundary helper ────────────────────────────────────────────────

pub fn ensure_within_workspace(workspace_root: &Path, target: &Path) -> anyhow::Result<PathBuf> {
    let canonical_root = workspace_root.canonicalize()?;
    let joined = if target.is_absolute() {
        target.to_path_buf()
    } else {
        canonical_root.join(target)
    };
    let canonical_target = joined.canonicalize()?;

    if !canonical_target.starts_with(&canonical_root) {
        anyhow::bail!("path escapes workspace boundary: {}", canonical_target.display());
    }
    Ok(canonical_target)
}

// ── Default registry ─────────────────────────────────────────────────────────

/// Registers the illustrative in-process tool fixtures (spec §6.1).
pub fn default_registry(workspace_root: PathBuf) -> ToolRegistry {
    use ambit_tools::builtins::{ReadFileTool, RunShellTool, WriteFileTool};

    let mut registry = ToolRegistry::default();
    registry.register(Box::new(ReadFileTool {
        workspace_root: workspace_root.clone(),
    }));
    registry.register(Box::new(WriteFileTool {
        workspace_root: workspace_root.clone(),
    }));
    registry.register(Box::new(RunShellTool { workspace_root }));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysClaims;

    #[async_trait]
    impl Interceptor for AlwaysClaims {
        async fn intercept(&self, _args: &HashMap<String, String>) -> Option<ToolResult> {
            Some(ToolResult::ok("intercepted"))
        }
    }

    #[test]
    fn workspace_guard_rejects_escape() -> anyhow::Result<()> {
        let base = std::env::temp_dir().join("ambit-exec-workspace-test");
        std::fs::create_dir_all(base.join("safe"))?;
        assert!(ensure_within_workspace(&base, &PathBuf::from("../")).is_err());
        Ok(())
    }

    #[test]
    fn workspace_guard_accepts_child_path() -> anyhow::Result<()> {
        let base = std::env::temp_dir().join("ambit-exec-ws-accept-test");
        std::fs::create_dir_all(base.join("subdir"))?;
        assert!(ensure_within_workspace(&base, &PathBuf::from("subdir")).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_tool_is_rejected_before_dispatch() {
        let mut registry = ToolRegistry::default();
        registry.disable("read_file");
        let executor = ToolExecutor::new(registry);

        let result = executor
            .execute("read_file", &HashMap::new(), &HashSet::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error_type, Some(ToolErrorType::PermissionDenied));
    }

    #[tokio::test]
    async fn interceptor_claims_before_in_process_dispatch() {
        let workspace = std::env::temp_dir().join("ambit-exec-intercept-test");
        std::fs::create_dir_all(&workspace).unwrap();
        let mut executor = ToolExecutor::new(default_registry(workspace));
        executor.set_interceptor("read_file", Box::new(AlwaysClaims));

        let result = executor
            .execute("read_file", &HashMap::new(), &HashSet::new())
            .await;
        assert!(result.success);
        assert_eq!(result.content, "intercepted");
    }

    #[tokio::test]
    async fn missing_required_arg_is_rejected_before_dispatch() {
        let workspace = std::env::temp_dir().join("ambit-exec-missing-arg-test");
        std::fs::create_dir_all(&workspace).unwrap();
        let executor = ToolExecutor::new(default_registry(workspace));

        // write_file requires both `path` and `content`; only supply `path`.
        let mut args = HashMap::new();
        args.insert("path".to_string(), "hello.txt".to_string());

        let result = executor.execute("write_file", &args, &HashSet::new()).await;
        assert!(!result.success);
        assert_eq!(result.error_type, Some(ToolErrorType::InvalidArgs));
        assert!(result.error.unwrap().contains("content"));
    }

    #[tokio::test]
    async fn unknown_tool_returns_invalid_args() {
        let executor = ToolExecutor::new(ToolRegistry::default());
        let result = executor
            .execute("does_not_exist", &HashMap::new(), &HashSet::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error_type, Some(ToolErrorType::InvalidArgs));
    }

    #[tokio::test]
    async fn read_file_dispatches_in_process() {
        let workspace = std::env::temp_dir().join("ambit-exec-read-test");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join("hello.txt"), "hi there").unwrap();

        let executor = ToolExecutor::new(default_registry(workspace));
        let mut args = HashMap::new();
        args.insert("path".to_string(), "hello.txt".to_string());

        let result = executor.execute("read_file", &args, &HashSet::new()).await;
        assert!(result.success);
        assert_eq!(result.content, "hi there");
    }
}
