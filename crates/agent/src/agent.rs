//! Agent (spec §4.6, "C6"): a stateful session participant that owns a
//! system prompt, an LLM Client handle, a filtered tool catalog, an
//! in-memory message history, and the Memory Store integration for turn
//! creation/finalization. Both the Meta-agent and ephemeral Task-agents are
//! this same type, distinguished only by `AgentVariant` and the tool
//! catalog/system prompt they're constructed with.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use ambit_config::ToolLoopConfig;
use ambit_exec::ToolExecutor;
use ambit_llm::{LLMMessage, LlmClient, Message, ProviderError};
use ambit_memory::{
    ConversationTurn, ConversationType, ExecutionStatus, MemoryStore, StorageError, ToolUsage, ToolUsagePatch, TurnPatch,
    TurnStatus,
};
use ambit_tools::ToolSpec;
use chrono::Utc;

use crate::tool_loop::{run_tool_loop, TerminationReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentVariant {
    /// `METAGEN`: the orchestrator every user message is first routed to.
    Meta,
    /// `TASK_AGENT_<id>`: ephemeral, spawned by the Router for one `execute_task` call.
    Task { task_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("llm provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub struct Agent {
    pub id: String,
    pub session_id: String,
    pub variant: AgentVariant,
    pub system_prompt: String,
    llm: Arc<LlmClient>,
    executor: Arc<ToolExecutor>,
    memory: Arc<MemoryStore>,
    tool_specs: Vec<ToolSpec>,
    caller_disabled: HashSet<String>,
    tool_loop_config: ToolLoopConfig,
    history: Vec<LLMMessage>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        variant: AgentVariant,
        system_prompt: impl Into<String>,
        llm: Arc<LlmClient>,
        executor: Arc<ToolExecutor>,
        memory: Arc<MemoryStore>,
        tool_specs: Vec<ToolSpec>,
        tool_loop_config: ToolLoopConfig,
    ) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            id: id.into(),
            session_id: session_id.into(),
            variant,
            system_prompt: system_prompt.clone(),
            llm,
            executor,
            memory,
            tool_specs,
            caller_disabled: HashSet::new(),
            tool_loop_config,
            history: vec![LLMMessage::system(system_prompt)],
        }
    }

    pub fn disable_tool(&mut self, name: impl Into<String>) {
        self.caller_disabled.insert(name.into());
    }

    /// Runs one user turn to completion, returning every `Message` emitted
    /// along the way (spec §4.6 `chat_stream`). The Memory Store turn is
    /// opened before the tool loop runs and finalized after it terminates,
    /// whatever the outcome.
    pub async fn chat_stream(&mut self, user_message: &str) -> Result<Vec<Message>, AgentError> {
        let turn_started = Instant::now();
        let turn_number = self.memory.next_turn_number(&self.id)?;
        let turn = ConversationTurn::new_in_progress(
            &self.id,
            &self.session_id,
            turn_number,
            "user",
            &self.id,
            ConversationType::UserAgent,
            user_message,
            match &self.variant {
                AgentVariant::Task { task_id } => Some(task_id.clone()),
                AgentVariant::Meta => None,
            },
        );
        let turn_id = self.memory.store_turn(turn)?;

        self.history.push(LLMMessage::user(user_message));
        let mut out = vec![Message::UserMessage {
            agent_id: self.id.clone(),
            session_id: self.session_id.clone(),
            content: user_message.to_string(),
        }];

        let llm_started = Instant::now();
        let outcome = run_tool_loop(
            &self.id,
            &self.session_id,
            &self.llm,
            &self.executor,
            &mut self.history,
            &self.tool_specs,
            &self.caller_disabled,
            &self.tool_loop_config,
        )
        .await;

        match outcome {
            Ok(outcome) => {
                self.persist_tool_usages(&turn_id, &outcome.messages);
                out.extend(outcome.messages);

                let patch = TurnPatch {
                    agent_response: Some(outcome.final_content),
                    total_duration_ms: Some(turn_started.elapsed().as_millis() as u64),
                    llm_duration_ms: Some(llm_started.elapsed().as_millis() as u64 - outcome.tools_duration_ms),
                    tools_duration_ms: Some(outcome.tools_duration_ms),
                    status: Some(match outcome.termination_reason {
                        TerminationReason::Natural => TurnStatus::Completed,
                        TerminationReason::Budget | TerminationReason::Iterations => TurnStatus::Partial,
                    }),
                    tools_used: Some(outcome.tools_used),
                    ..Default::default()
                };
                let _ = self.memory.update_turn(&turn_id, &patch);

                Ok(out)
            }
            Err(e) => {
                out.push(Message::ErrorMessage {
                    agent_id: self.id.clone(),
                    session_id: self.session_id.clone(),
                    error: e.to_string(),
                });
                let patch = TurnPatch {
                    total_duration_ms: Some(turn_started.elapsed().as_millis() as u64),
                    status: Some(TurnStatus::Error),
                    error_details: Some(serde_json::json!({ "error": e.to_string() })),
                    ..Default::default()
                };
                let _ = self.memory.update_turn(&turn_id, &patch);
                Err(e)
            }
        }
    }

    /// Records a `ToolUsage` row per tool call and keeps it in sync with the
    /// call/started/result messages the loop produced for this turn.
    fn persist_tool_usages(&self, turn_id: &str, messages: &[Message]) {
        let mut usage_ids: HashMap<String, String> = HashMap::new();

        for message in messages {
            match message {
                Message::ToolCallMessage { tool_calls, .. } => {
                    for call in tool_calls {
                        let usage = ToolUsage::new(
                            turn_id,
                            &self.id,
                            &call.tool_name,
                            call.tool_args.clone(),
                            Some(call.tool_id.clone()),
                            false,
                        );
                        if let Ok(id) = self.memory.store_tool_usage(usage) {
                            usage_ids.insert(call.tool_id.clone(), id);
                        }
                    }
                }
                Message::ToolStartedMessage { tool_id, .. } => {
                    if let Some(id) = usage_ids.get(tool_id) {
                        let patch = ToolUsagePatch {
                            execution_started_at: Some(Utc::now()),
                            execution_status: Some(ExecutionStatus::Executing),
                            ..Default::default()
                        };
                        let _ = self.memory.update_tool_usage(id, &patch);
                    }
                }
                Message::ToolResultMessage { tool_id, result, .. } => {
                    if let Some(id) = usage_ids.get(tool_id) {
                        let patch = ToolUsagePatch {
                            execution_completed_at: Some(Utc::now()),
                            execution_status: Some(ExecutionStatus::Completed),
                            execution_result: Some(serde_json::json!({ "content": result })),
                            ..Default::default()
                        };
                        let _ = self.memory.update_tool_usage(id, &patch);
                    }
                }
                Message::ToolErrorMessage { tool_id, error, .. } => {
                    if let Some(id) = usage_ids.get(tool_id) {
                        let patch = ToolUsagePatch {
                            execution_completed_at: Some(Utc::now()),
                            execution_status: Some(ExecutionStatus::Failed),
                            execution_error: Some(error.clone()),
                            ..Default::default()
                        };
                        let _ = self.memory.update_tool_usage(id, &patch);
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambit_config::MemoryConfig;
    use ambit_llm::testing::ScriptedProvider;
    use ambit_llm::{GenerateResponse, Usage};
    use ambit_tools::ToolRegistry;
    use tempfile::tempdir;

    fn open_store() -> (Arc<MemoryStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memory.redb");
        let store = MemoryStore::open_at(&path, &MemoryConfig::default()).unwrap();
        (Arc::new(store), dir)
    }

    #[tokio::test]
    async fn chat_stream_finalizes_turn_on_natural_completion() {
        let (memory, _dir) = open_store();
        let provider = ScriptedProvider::new(vec![GenerateResponse {
            content: Some("hi back".to_string()),
            tool_calls: vec![],
            usage: Usage { input_tokens: 3, output_tokens: 2, total_tokens: 5 },
        }]);
        let llm = Arc::new(LlmClient::new(Box::new(provider)));
        let executor = Arc::new(ToolExecutor::new(ToolRegistry::default()));

        let mut agent = Agent::new(
            "METAGEN",
            "session-1",
            AgentVariant::Meta,
            "you are the orchestrator",
            llm,
            executor,
            memory.clone(),
            vec![],
            ToolLoopConfig::default(),
        );

        let messages = agent.chat_stream("hello").await.unwrap();
        assert!(messages.iter().any(|m| m.is_final_agent_message()));

        let turns = memory.get_turns_by_agent("METAGEN", None, None).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].status, TurnStatus::Completed);
        assert_eq!(turns[0].agent_response.as_deref(), Some("hi back"));
    }
}
