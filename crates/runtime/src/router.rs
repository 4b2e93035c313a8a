//! Agent Manager / Router (spec §4.7, "C7"): owns the Meta-agent and
//! Task-agent lifecycles for one session, mediates `chat_stream` for the
//! external caller, and implements the `execute_task` interception that
//! turns one tool call into a subordinate agent session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use ambit_agent::{Agent, AgentVariant};
use ambit_config::AppConfig;
use ambit_exec::{toolserver::ServerConfig, Interceptor, ToolExecutor};
use ambit_llm::{LlmClient, Message};
use ambit_memory::{MemoryStore, StorageError};
use ambit_tools::{ToolErrorType, ToolRegistry, ToolResult, ToolSpec};
use async_trait::async_trait;

use crate::task_tools::{CreateTaskTool, ExecuteTaskStub, ListTasksTool};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("agent error: {0}")]
    Agent(#[from] ambit_agent::AgentError),
}

const META_SYSTEM_PROMPT: &str = "You are the orchestrating agent for this session. \
You can read and write files, run shell commands, define tasks with create_task, \
inspect them with list_tasks, and run one with execute_task.";

pub struct Router {
    meta_agent: Agent,
    execute_task_sink: Arc<Mutex<VecDeque<Vec<Message>>>>,
}

impl Router {
    /// Brings up the Memory Store (with recovery), the Tool Registry, any
    /// configured subprocess tool servers, the LLM Client, and the
    /// Meta-agent — then wires the `execute_task` interceptor (spec §4.7
    /// "Initialization").
    pub async fn new(config: AppConfig, workspace_root: PathBuf, session_id: impl Into<String>) -> Result<Self, RouterError> {
        let llm = Arc::new(LlmClient::from_provider_name(&config.llm.provider, &config.llm.model));
        Self::with_llm(config, workspace_root, session_id, llm).await
    }

    /// Same bring-up as [`Router::new`], but takes an already-constructed
    /// `LlmClient` instead of building one from `config.llm` — lets
    /// integration tests drive the Router end to end against a
    /// `ambit_llm::testing::ScriptedProvider` instead of a real provider.
    pub async fn with_llm(
        config: AppConfig,
        workspace_root: PathBuf,
        session_id: impl Into<String>,
        llm: Arc<LlmClient>,
    ) -> Result<Self, RouterError> {
        let session_id = session_id.into();
        let memory = Arc::new(MemoryStore::open(&config.memory)?);
        let report = memory.recover_abandoned()?;
        if report.turns_abandoned > 0 || report.tool_usages_abandoned > 0 {
            tracing::warn!(
                turns_abandoned = report.turns_abandoned,
                tool_usages_abandoned = report.tool_usages_abandoned,
                "recovered abandoned state from a prior crash"
            );
        }

        let mut registry = ambit_exec::default_registry(workspace_root);
        for name in &config.disabled_tools.disabled_tools {
            registry.disable(name);
        }
        register_task_tools(&mut registry, memory.clone());

        let mut executor = ToolExecutor::new(registry);
        if !config.tool_servers.is_empty() {
            let supervisor = ambit_exec::toolserver::ToolServerSupervisor::new(config.supervisor.clone());
            for entry in &config.tool_servers {
                supervisor
                    .start_server(ServerConfig {
                        id: entry.id.clone(),
                        command: entry.command.clone(),
                        args: entry.args.clone(),
                        env: entry.env.clone(),
                    })
                    .await;
            }
            executor = executor.with_supervisor(supervisor);
        }

        // The interceptor needs a handle back to the executor it's installed
        // into, but `set_interceptor` needs `&mut self` before the executor
        // is behind its final `Arc`. Hand it a `Weak` slot now and fill it
        // in once the `Arc` exists.
        let executor_slot: Arc<Mutex<Option<Weak<ToolExecutor>>>> = Arc::new(Mutex::new(None));
        let sink = Arc::new(Mutex::new(VecDeque::new()));

        let task_tool_specs: Vec<ToolSpec> = executor
            .registry()
            .list_tools(&HashSet::new())
            .into_iter()
            .filter(|s| s.name != "execute_task")
            .collect();

        let interceptor = ExecuteTaskInterceptor {
            memory: memory.clone(),
            llm: llm.clone(),
            executor: executor_slot.clone(),
            task_tool_specs: task_tool_specs.clone(),
            tool_loop_config: config.tool_loop.clone(),
            session_id: session_id.clone(),
            sink: sink.clone(),
        };
        executor.set_interceptor("execute_task", Box::new(interceptor));

        let executor = Arc::new(executor);
        *executor_slot.lock().unwrap() = Some(Arc::downgrade(&executor));

        let meta_tool_specs = executor.list_tools(&HashSet::new()).await;

        let meta_agent = Agent::new(
            "METAGEN",
            session_id,
            AgentVariant::Meta,
            META_SYSTEM_PROMPT,
            llm,
            executor.clone(),
            memory,
            meta_tool_specs,
            config.tool_loop,
        );

        Ok(Self { meta_agent, execute_task_sink: sink })
    }

    /// Forward `user_msg` to the Meta-agent; intercept any `execute_task`
    /// call transparently (the interceptor itself spawns the Task-agent),
    /// splicing its forwarded messages back into the returned stream in the
    /// position its `ToolStartedMessage` occupies (spec §4.7 step 5-6).
    pub async fn chat_stream(&mut self, user_msg: &str) -> Result<Vec<Message>, RouterError> {
        let outer = self.meta_agent.chat_stream(user_msg).await?;
        let mut merged = Vec::with_capacity(outer.len());
        let mut pending = self.execute_task_sink.lock().unwrap();

        for message in outer {
            let is_execute_task_start =
                matches!(&message, Message::ToolStartedMessage { tool_name, .. } if tool_name == "execute_task");
            merged.push(message);
            if is_execute_task_start {
                if let Some(forwarded) = pending.pop_front() {
                    merged.extend(forwarded);
                }
            }
        }
        Ok(merged)
    }
}

fn register_task_tools(registry: &mut ToolRegistry, memory: Arc<MemoryStore>) {
    registry.register(Box::new(CreateTaskTool { memory: memory.clone() }));
    registry.register(Box::new(ListTasksTool { memory }));
    registry.register(Box::new(ExecuteTaskStub));
}

/// Turns one `execute_task` call into a subordinate Task-agent session
/// (spec §4.7 "execute_task interceptor").
struct ExecuteTaskInterceptor {
    memory: Arc<MemoryStore>,
    llm: Arc<LlmClient>,
    executor: Arc<Mutex<Option<Weak<ToolExecutor>>>>,
    task_tool_specs: Vec<ToolSpec>,
    tool_loop_config: ambit_config::ToolLoopConfig,
    session_id: String,
    sink: Arc<Mutex<VecDeque<Vec<Message>>>>,
}

#[async_trait]
impl Interceptor for ExecuteTaskInterceptor {
    async fn intercept(&self, args: &HashMap<String, String>) -> Option<ToolResult> {
        Some(self.run(args).await)
    }
}

impl ExecuteTaskInterceptor {
    async fn run(&self, args: &HashMap<String, String>) -> ToolResult {
        let Some(task_id) = args.get("task_id") else {
            self.sink.lock().unwrap().push_back(Vec::new());
            return ToolResult::err(ToolErrorType::ExecutionError, "execute_task requires a 'task_id' argument");
        };

        let task = match self.memory.get_task_config(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.sink.lock().unwrap().push_back(Vec::new());
                return ToolResult::err(ToolErrorType::ExecutionError, format!("no task found with id '{task_id}'"));
            }
            Err(e) => {
                self.sink.lock().unwrap().push_back(Vec::new());
                return ToolResult::err(ToolErrorType::ExecutionError, format!("Tool execution failed: {e}"));
            }
        };

        let mut input_values: HashMap<String, String> = args.clone();
        input_values.remove("task_id");
        for param in &task.definition.input_schema {
            if input_values.contains_key(&param.name) {
                continue;
            }
            if let Some(default) = &param.default {
                input_values.insert(param.name.clone(), value_to_plain_string(default));
            } else if param.required {
                self.sink.lock().unwrap().push_back(Vec::new());
                return ToolResult::err(
                    ToolErrorType::ExecutionError,
                    format!("missing required parameter '{}' for task '{}'", param.name, task.name),
                );
            }
        }

        let Some(executor) = self.executor.lock().unwrap().as_ref().and_then(Weak::upgrade) else {
            self.sink.lock().unwrap().push_back(Vec::new());
            return ToolResult::err(ToolErrorType::ExecutionError, "Tool execution failed: executor no longer available");
        };

        let instructions = substitute_params(&task.definition.instructions, &input_values);
        let agent_id = format!("TASK_AGENT_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

        let mut task_agent = Agent::new(
            agent_id.clone(),
            self.session_id.clone(),
            ambit_agent::AgentVariant::Task { task_id: task.id.clone() },
            instructions,
            self.llm.clone(),
            executor,
            self.memory.clone(),
            self.task_tool_specs.clone(),
            self.tool_loop_config.clone(),
        );
        task_agent.disable_tool("execute_task");

        let user_content = format!(
            "Execute task '{}' with inputs: {}",
            task.name,
            serde_json::to_string(&input_values).unwrap_or_else(|_| "{}".to_string())
        );

        let messages = match task_agent.chat_stream(&user_content).await {
            Ok(messages) => messages,
            Err(e) => {
                self.sink.lock().unwrap().push_back(Vec::new());
                return ToolResult::err(ToolErrorType::ExecutionError, format!("Tool execution failed: {e}"));
            }
        };

        let mut output = String::new();
        let mut forwarded = Vec::with_capacity(messages.len());
        for message in messages {
            if message.is_final_agent_message() {
                if let Message::AgentMessage { content, .. } = &message {
                    output = content.clone();
                }
                continue;
            }
            forwarded.push(message);
        }
        self.sink.lock().unwrap().push_back(forwarded);

        let result = serde_json::json!({
            "task_id": task.id,
            "task_name": task.name,
            "agent_id": agent_id,
            "output": output,
        });
        ToolResult::ok(result.to_string())
    }
}

fn substitute_params(template: &str, values: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (k, v) in values {
        out = out.replace(&format!("{{{k}}}"), v);
    }
    out
}

fn value_to_plain_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
