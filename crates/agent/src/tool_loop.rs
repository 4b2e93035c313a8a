//! Agentic Tool Loop (spec §4.5, "C5"): alternates LLM calls and tool
//! executions for a single turn, enforcing the hard/soft termination
//! budgets and detecting runaway repeated-call patterns.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use ambit_config::ToolLoopConfig;
use ambit_exec::ToolExecutor;
use ambit_llm::{GenerateResponse, LLMMessage, LlmClient, Message, ProviderError, ToolCallRequest};
use ambit_tools::{ToolErrorType, ToolResult, ToolSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    Natural,
    Budget,
    Iterations,
}

#[derive(Debug, Clone)]
pub struct ToolLoopOutcome {
    pub messages: Vec<Message>,
    pub final_content: String,
    pub termination_reason: TerminationReason,
    pub iterations: u32,
    pub tokens_used: u64,
    pub tools_duration_ms: u64,
    pub tools_used: bool,
}

fn canonical_args(args: &serde_json::Value) -> String {
    // serde_json's default `Map` is a `BTreeMap` (the `preserve_order`
    // feature is off), so `to_string` already yields keys in sorted order —
    // that's what makes this a stable fingerprint input.
    args.to_string()
}

fn fingerprint(tool_name: &str, args: &serde_json::Value) -> String {
    format!("{tool_name}:{}", canonical_args(args))
}

fn args_to_string_map(args: &serde_json::Value) -> HashMap<String, String> {
    args.as_object()
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let s = match v {
                        serde_json::Value::String(s) => s.clone(),
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    (k.clone(), s)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Runs one turn to completion against `history` (mutated in place with the
/// assistant/tool messages produced along the way) per the spec's
/// per-iteration algorithm. `history` must already contain the system
/// prompt and the new user message before this is called.
pub async fn run_tool_loop(
    agent_id: &str,
    session_id: &str,
    llm: &LlmClient,
    executor: &ToolExecutor,
    history: &mut Vec<LLMMessage>,
    tools: &[ToolSpec],
    caller_disabled: &HashSet<String>,
    config: &ToolLoopConfig,
) -> Result<ToolLoopOutcome, ProviderError> {
    let mut messages = Vec::new();
    let mut final_content = String::new();
    let mut tokens_used: u64 = 0;
    let mut tools_duration_ms: u64 = 0;
    let mut tools_used = false;
    let mut fingerprint_counts: HashMap<String, u32> = HashMap::new();
    let mut total_tool_calls: u32 = 0;
    let mut last_agent_message_index: Option<usize> = None;
    let termination;
    let mut iteration_count: u32 = 0;

    loop {
        iteration_count += 1;
        let response: GenerateResponse = llm.generate(history, tools).await?;

        tokens_used += response.usage.total_tokens;

        if let Some(content) = &response.content {
            if !content.is_empty() {
                messages.push(Message::AgentMessage {
                    agent_id: agent_id.to_string(),
                    session_id: session_id.to_string(),
                    content: content.clone(),
                    r#final: false,
                });
                last_agent_message_index = Some(messages.len() - 1);
            }
        }

        if response.tool_calls.is_empty() {
            final_content = response.content.clone().unwrap_or_default();
            if let Some(idx) = last_agent_message_index {
                messages[idx].mark_final();
            } else {
                messages.push(Message::AgentMessage {
                    agent_id: agent_id.to_string(),
                    session_id: session_id.to_string(),
                    content: final_content.clone(),
                    r#final: true,
                });
            }
            termination = TerminationReason::Natural;
            break;
        }

        messages.push(Message::ToolCallMessage {
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            tool_calls: response.tool_calls.clone(),
        });
        tools_used = true;

        let mut results: Vec<(String, ToolResult)> = Vec::with_capacity(response.tool_calls.len());
        for call in &response.tool_calls {
            let fp = fingerprint(&call.tool_name, &call.tool_args);
            let seen = *fingerprint_counts.get(&fp).unwrap_or(&0);

            if seen >= config.max_repeated_calls {
                let result = ToolResult::err(
                    ToolErrorType::LoopDetected,
                    format!(
                        "Tool '{}' with arguments {} has been called {} times. Skipping to prevent infinite loop.",
                        call.tool_name,
                        call.tool_args,
                        seen + 1
                    ),
                );
                messages.push(error_message(agent_id, session_id, call, &result));
                fingerprint_counts.insert(fp, seen + 1);
                total_tool_calls += 1;
                results.push((call.tool_id.clone(), result));
                continue;
            }

            if total_tool_calls >= config.max_tools_per_turn {
                let result = ToolResult::err(
                    ToolErrorType::ResourceLimit,
                    format!(
                        "Resource limit exceeded: tools_per_turn ({}/{}). Cannot execute tool '{}'.",
                        total_tool_calls, config.max_tools_per_turn, call.tool_name
                    ),
                );
                messages.push(error_message(agent_id, session_id, call, &result));
                fingerprint_counts.insert(fp, seen + 1);
                total_tool_calls += 1;
                results.push((call.tool_id.clone(), result));
                continue;
            }

            messages.push(Message::ToolStartedMessage {
                agent_id: agent_id.to_string(),
                session_id: session_id.to_string(),
                tool_id: call.tool_id.clone(),
                tool_name: call.tool_name.clone(),
            });

            let started = Instant::now();
            let args = args_to_string_map(&call.tool_args);
            let result = executor.execute(&call.tool_name, &args, caller_disabled).await;
            tools_duration_ms += started.elapsed().as_millis() as u64;

            if result.success {
                messages.push(Message::ToolResultMessage {
                    agent_id: agent_id.to_string(),
                    session_id: session_id.to_string(),
                    tool_id: call.tool_id.clone(),
                    tool_name: call.tool_name.clone(),
                    result: result.content.clone(),
                });
            } else {
                messages.push(error_message(agent_id, session_id, call, &result));
            }

            fingerprint_counts.insert(fp, seen + 1);
            total_tool_calls += 1;
            results.push((call.tool_id.clone(), result));
        }

        history.extend(ambit_llm::format_tool_results(&response.tool_calls, &results));

        if tokens_used >= config.max_token_budget {
            termination = TerminationReason::Budget;
            break;
        }
        if iteration_count >= config.max_iterations {
            termination = TerminationReason::Iterations;
            break;
        }
    }

    Ok(ToolLoopOutcome {
        messages,
        final_content,
        termination_reason: termination,
        iterations: iteration_count,
        tokens_used,
        tools_duration_ms,
        tools_used,
    })
}

fn error_message(agent_id: &str, session_id: &str, call: &ToolCallRequest, result: &ToolResult) -> Message {
    Message::ToolErrorMessage {
        agent_id: agent_id.to_string(),
        session_id: session_id.to_string(),
        tool_id: call.tool_id.clone(),
        tool_name: call.tool_name.clone(),
        error: result.error.clone().unwrap_or_default(),
        error_type: result.error_type.unwrap_or(ToolErrorType::ExecutionError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambit_llm::testing::ScriptedProvider;
    use ambit_llm::{GenerateResponse, LlmClient, Usage};
    use ambit_tools::ToolRegistry;

    fn config() -> ToolLoopConfig {
        ToolLoopConfig { max_iterations: 50, max_tools_per_turn: 100, max_repeated_calls: 5, max_token_budget: 1_000_000 }
    }

    #[tokio::test]
    async fn terminates_naturally_when_no_tool_calls() {
        let provider = ScriptedProvider::new(vec![GenerateResponse {
            content: Some("hello there".to_string()),
            tool_calls: vec![],
            usage: Usage::default(),
        }]);
        let llm = LlmClient::new(Box::new(provider));
        let executor = ToolExecutor::new(ToolRegistry::default());
        let mut history = vec![LLMMessage::user("hi")];

        let outcome = run_tool_loop("meta", "s1", &llm, &executor, &mut history, &[], &HashSet::new(), &config())
            .await
            .unwrap();

        assert_eq!(outcome.termination_reason, TerminationReason::Natural);
        assert_eq!(outcome.final_content, "hello there");
        assert!(matches!(outcome.messages.last().unwrap(), Message::AgentMessage { r#final: true, .. }));
    }

    #[tokio::test]
    async fn repeated_identical_calls_trigger_loop_detection() {
        let call = ToolCallRequest { tool_id: "1".into(), tool_name: "noop".into(), tool_args: serde_json::json!({"x": 1}) };
        let mut script = Vec::new();
        for _ in 0..6 {
            script.push(GenerateResponse { content: None, tool_calls: vec![call.clone()], usage: Usage::default() });
        }
        script.push(GenerateResponse { content: Some("done".to_string()), tool_calls: vec![], usage: Usage::default() });

        let provider = ScriptedProvider::new(script);
        let llm = LlmClient::new(Box::new(provider));
        let executor = ToolExecutor::new(ToolRegistry::default());
        let mut history = vec![LLMMessage::user("hi")];

        let mut cfg = config();
        cfg.max_repeated_calls = 5;
        let outcome = run_tool_loop("meta", "s1", &llm, &executor, &mut history, &[], &HashSet::new(), &cfg)
            .await
            .unwrap();

        let loop_detected = outcome.messages.iter().any(|m| {
            matches!(m, Message::ToolErrorMessage { error_type: ToolErrorType::LoopDetected, .. })
        });
        assert!(loop_detected);
    }

    #[tokio::test]
    async fn hits_iteration_cap_when_model_never_stops_calling_tools() {
        let call = ToolCallRequest { tool_id: "1".into(), tool_name: "noop".into(), tool_args: serde_json::json!({}) };
        let script: Vec<_> = (0..3)
            .map(|_| GenerateResponse { content: None, tool_calls: vec![call.clone()], usage: Usage::default() })
            .collect();
        let provider = ScriptedProvider::new(script);
        let llm = LlmClient::new(Box::new(provider));
        let executor = ToolExecutor::new(ToolRegistry::default());
        let mut history = vec![LLMMessage::user("hi")];

        let mut cfg = config();
        cfg.max_iterations = 3;
        let outcome = run_tool_loop("meta", "s1", &llm, &executor, &mut history, &[], &HashSet::new(), &cfg)
            .await
            .unwrap();

        assert_eq!(outcome.termination_reason, TerminationReason::Iterations);
        assert_eq!(outcome.iterations, 3);
    }
}
