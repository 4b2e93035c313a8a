//! End-to-end scenario tests driving `ambit_runtime::Router` against a
//! scripted LLM provider (spec §8). Each test opens its own `redb` file
//! under a tempdir so the Memory Store side effects can be inspected
//! directly once the Router call returns.

use std::sync::Arc;

use ambit_config::{AppConfig, MemoryConfig};
use ambit_llm::testing::ScriptedProvider;
use ambit_llm::{GenerateResponse, LlmClient, Message, ToolCallRequest, Usage};
use ambit_memory::{ConversationTurn, ConversationType, MemoryStore, Parameter, ParamType, TaskConfig, TaskDefinition, TurnStatus};
use ambit_runtime::Router;
use ambit_tools::ToolErrorType;
use tempfile::tempdir;

fn test_config(db_path: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.memory.db_path = db_path.to_string_lossy().to_string();
    config
}

fn llm_from(script: Vec<GenerateResponse>) -> Arc<LlmClient> {
    Arc::new(LlmClient::new(Box::new(ScriptedProvider::new(script))))
}

fn text_response(content: &str) -> GenerateResponse {
    GenerateResponse { content: Some(content.to_string()), tool_calls: vec![], usage: Usage::default() }
}

#[tokio::test]
async fn scenario_1_create_task() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("memory.redb");
    let config = test_config(&db_path);

    let create_call = ToolCallRequest {
        tool_id: "call-1".to_string(),
        tool_name: "create_task".to_string(),
        tool_args: serde_json::json!({
            "name": "summarize",
            "description": "Summarizes a document",
            "instructions": "Summarize: {document}",
        }),
    };
    let llm = llm_from(vec![
        GenerateResponse { content: None, tool_calls: vec![create_call], usage: Usage::default() },
        text_response("Created the 'summarize' task."),
    ]);

    let mut router = Router::with_llm(config, dir.path().to_path_buf(), "session-1", llm).await.unwrap();
    let messages = router.chat_stream("Define a task that summarizes documents").await.unwrap();

    assert!(messages.iter().any(|m| matches!(m, Message::ToolResultMessage { tool_name, .. } if tool_name == "create_task")));
    assert!(messages.iter().any(|m| m.is_final_agent_message()));

    let memory = MemoryStore::open_at(&db_path, &MemoryConfig::default()).unwrap();
    let tasks = memory.list_task_configs().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].name, "summarize");
}

#[tokio::test]
async fn scenario_2_execute_task_end_to_end() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("memory.redb");

    let task_id = {
        let memory = MemoryStore::open_at(&db_path, &MemoryConfig::default()).unwrap();
        let config = TaskConfig::new(TaskDefinition {
            name: "greet".to_string(),
            description: "Greets someone".to_string(),
            instructions: "Say hello to {who}".to_string(),
            input_schema: vec![Parameter {
                name: "who".to_string(),
                description: "Name to greet".to_string(),
                param_type: ParamType::String,
                required: true,
                default: None,
            }],
            output_schema: vec![],
            task_type: "generic".to_string(),
        });
        let id = config.id.clone();
        memory.store_task_config(config).unwrap();
        id
    };

    let execute_call = ToolCallRequest {
        tool_id: "call-1".to_string(),
        tool_name: "execute_task".to_string(),
        tool_args: serde_json::json!({ "task_id": task_id, "who": "Ada" }),
    };
    let llm = llm_from(vec![
        GenerateResponse { content: None, tool_calls: vec![execute_call], usage: Usage::default() },
        text_response("Hello, Ada!"),
        text_response("The task agent greeted Ada."),
    ]);

    let config = test_config(&db_path);
    let mut router = Router::with_llm(config, dir.path().to_path_buf(), "session-2", llm).await.unwrap();
    let messages = router.chat_stream("Run the greet task for Ada").await.unwrap();

    assert!(messages
        .iter()
        .any(|m| matches!(m, Message::ToolStartedMessage { tool_name, .. } if tool_name == "execute_task")));
    assert!(messages.iter().any(|m| m.agent_id().starts_with("TASK_AGENT_")));
    assert!(messages.iter().any(|m| m.is_final_agent_message() && m.agent_id() == "METAGEN"));

    let memory = MemoryStore::open_at(&db_path, &MemoryConfig::default()).unwrap();
    let turns = memory.get_turns_by_session("session-2", None).unwrap();
    assert_eq!(turns.len(), 2);
    assert!(turns.iter().any(|t| t.agent_id == "METAGEN"));
    assert!(turns.iter().any(|t| t.agent_id.starts_with("TASK_AGENT_")));
    assert!(turns.iter().all(|t| t.status == TurnStatus::Completed));
}

#[tokio::test]
async fn scenario_3_loop_detection_bounds_runaway_tool_calls() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("memory.redb");
    let mut config = test_config(&db_path);
    config.tool_loop.max_repeated_calls = 5;
    config.tool_loop.max_iterations = 20;

    let repeated_call = ToolCallRequest {
        tool_id: "call-1".to_string(),
        tool_name: "read_file".to_string(),
        tool_args: serde_json::json!({ "path": "does-not-exist.txt" }),
    };
    let mut script: Vec<GenerateResponse> = (0..7)
        .map(|_| GenerateResponse { content: None, tool_calls: vec![repeated_call.clone()], usage: Usage::default() })
        .collect();
    script.push(text_response("Giving up on that file."));
    let llm = llm_from(script);

    let mut router = Router::with_llm(config, dir.path().to_path_buf(), "session-3", llm).await.unwrap();
    let messages = router.chat_stream("Keep reading that file").await.unwrap();

    let loop_detected = messages
        .iter()
        .any(|m| matches!(m, Message::ToolErrorMessage { error_type: ToolErrorType::LoopDetected, .. }));
    assert!(loop_detected);
    assert!(messages.iter().any(|m| m.is_final_agent_message()));

    let memory = MemoryStore::open_at(&db_path, &MemoryConfig::default()).unwrap();
    let turns = memory.get_turns_by_agent("METAGEN", None, None).unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].status, TurnStatus::Completed);
}

#[tokio::test]
async fn scenario_4_crash_recovery_marks_in_progress_turn_abandoned() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("memory.redb");

    {
        let memory = MemoryStore::open_at(&db_path, &MemoryConfig::default()).unwrap();
        let turn = ConversationTurn::new_in_progress(
            "METAGEN",
            "session-4",
            1,
            "user",
            "METAGEN",
            ConversationType::UserAgent,
            "a message that never finished",
            None,
        );
        memory.store_turn(turn).unwrap();
    }

    let config = test_config(&db_path);
    let llm = llm_from(vec![text_response("fresh session, unrelated to the crash")]);
    let _router = Router::with_llm(config, dir.path().to_path_buf(), "session-5", llm).await.unwrap();

    let memory = MemoryStore::open_at(&db_path, &MemoryConfig::default()).unwrap();
    let turns = memory.get_turns_by_agent("METAGEN", None, None).unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].status, TurnStatus::Abandoned);
    assert_eq!(
        turns[0].error_details,
        Some(serde_json::json!({ "error": "Conversation was abandoned (system shutdown)" }))
    );
}

#[tokio::test]
async fn scenario_6_task_parameter_defaults_are_substituted() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("memory.redb");

    let task_id = {
        let memory = MemoryStore::open_at(&db_path, &MemoryConfig::default()).unwrap();
        let config = TaskConfig::new(TaskDefinition {
            name: "truncate".to_string(),
            description: "Truncates text to a length".to_string(),
            instructions: "Truncate the input to {max_length} characters".to_string(),
            input_schema: vec![Parameter {
                name: "max_length".to_string(),
                description: "Maximum output length".to_string(),
                param_type: ParamType::Integer,
                required: false,
                default: Some(serde_json::json!(100)),
            }],
            output_schema: vec![],
            task_type: "generic".to_string(),
        });
        let id = config.id.clone();
        memory.store_task_config(config).unwrap();
        id
    };

    // `max_length` is omitted here; the interceptor must fall back to its default.
    let execute_call = ToolCallRequest {
        tool_id: "call-1".to_string(),
        tool_name: "execute_task".to_string(),
        tool_args: serde_json::json!({ "task_id": task_id }),
    };
    let llm = llm_from(vec![
        GenerateResponse { content: None, tool_calls: vec![execute_call], usage: Usage::default() },
        text_response("Truncated."),
        text_response("Done."),
    ]);

    let config = test_config(&db_path);
    let mut router = Router::with_llm(config, dir.path().to_path_buf(), "session-6", llm).await.unwrap();
    let messages = router.chat_stream("Run the truncate task with defaults").await.unwrap();

    let forwarded_user_message = messages.iter().find_map(|m| match m {
        Message::UserMessage { agent_id, content, .. } if agent_id.starts_with("TASK_AGENT_") => Some(content.clone()),
        _ => None,
    });
    let content = forwarded_user_message.expect("task agent's invocation message should have been forwarded");
    assert!(content.contains("\"max_length\":\"100\""));
}
