//! LLM Client (spec §4.4, "C4"): a uniform request/response surface over
//! whichever concrete provider is configured. Nothing above this layer ever
//! sees a provider-specific wire type — only `LLMMessage` in, `Message` (or
//! `GenerateResponse`) out.

pub mod testing;

use ambit_tools::{ToolErrorType, ToolResult, ToolSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ── Internal message representation ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn of the provider-agnostic conversation fed into `generate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMMessage {
    pub role: LlmRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl LLMMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: LlmRole::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: LlmRole::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: LlmRole::Assistant, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self { role: LlmRole::Assistant, content: None, tool_calls, tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: LlmRole::Tool, content: Some(content.into()), tool_calls: vec![], tool_call_id: Some(tool_call_id.into()) }
    }
}

/// A tool call the model wants dispatched (spec §3 `ToolCallRequest`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub tool_id: String,
    pub tool_name: String,
    pub tool_args: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Result of a single non-streaming completion.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("llm provider '{provider}' is unavailable: {detail}")]
    Unavailable { provider: String, detail: String },
    #[error("llm provider '{provider}' returned an error ({status}): {body}")]
    Http { provider: String, status: u16, body: String },
    #[error("llm provider '{provider}' returned a response this client could not parse: {detail}")]
    MalformedResponse { provider: String, detail: String },
}

pub type ProviderResult<T> = Result<T, ProviderError>;

// ── Unified message stream (spec §3 "Message", Glossary) ────────────────────

/// The heterogeneous event stream every agent, the tool loop, and the router
/// forward downstream. Every variant carries `agent_id`/`session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "user_message")]
    UserMessage { agent_id: String, session_id: String, content: String },
    #[serde(rename = "agent_message")]
    AgentMessage { agent_id: String, session_id: String, content: String, r#final: bool },
    #[serde(rename = "thinking_message")]
    ThinkingMessage { agent_id: String, session_id: String, content: String },
    #[serde(rename = "tool_call_message")]
    ToolCallMessage { agent_id: String, session_id: String, tool_calls: Vec<ToolCallRequest> },
    #[serde(rename = "tool_started_message")]
    ToolStartedMessage { agent_id: String, session_id: String, tool_id: String, tool_name: String },
    #[serde(rename = "tool_result_message")]
    ToolResultMessage { agent_id: String, session_id: String, tool_id: String, tool_name: String, result: String },
    #[serde(rename = "tool_error_message")]
    ToolErrorMessage {
        agent_id: String,
        session_id: String,
        tool_id: String,
        tool_name: String,
        error: String,
        error_type: ToolErrorType,
    },
    #[serde(rename = "error_message")]
    ErrorMessage { agent_id: String, session_id: String, error: String },
    #[serde(rename = "usage_message")]
    UsageMessage {
        agent_id: String,
        session_id: String,
        input_tokens: u64,
        output_tokens: u64,
        total_tokens: u64,
    },
}

impl Message {
    pub fn agent_id(&self) -> &str {
        match self {
            Message::UserMessage { agent_id, .. }
            | Message::AgentMessage { agent_id, .. }
            | Message::ThinkingMessage { agent_id, .. }
            | Message::ToolCallMessage { agent_id, .. }
            | Message::ToolStartedMessage { agent_id, .. }
            | Message::ToolResultMessage { agent_id, .. }
            | Message::ToolErrorMessage { agent_id, .. }
            | Message::ErrorMessage { agent_id, .. }
            | Message::UsageMessage { agent_id, .. } => agent_id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Message::UserMessage { session_id, .. }
            | Message::AgentMessage { session_id, .. }
            | Message::ThinkingMessage { session_id, .. }
            | Message::ToolCallMessage { session_id, .. }
            | Message::ToolStartedMessage { session_id, .. }
            | Message::ToolResultMessage { session_id, .. }
            | Message::ToolErrorMessage { session_id, .. }
            | Message::ErrorMessage { session_id, .. }
            | Message::UsageMessage { session_id, .. } => session_id,
        }
    }

    /// `true` for an `AgentMessage` with `final=true` — the signal the tool
    /// loop and router use to know a turn has produced its last word.
    pub fn is_final_agent_message(&self) -> bool {
        matches!(self, Message::AgentMessage { r#final: true, .. })
    }

    pub fn mark_final(&mut self) {
        if let Message::AgentMessage { r#final, .. } = self {
            *r#final = true;
        }
    }
}

/// Builds the unified `AgentMessage`/`ToolCallMessage`/`UsageMessage`
/// sequence a streaming `generate` call emits (spec §4.4).
pub fn response_to_messages(agent_id: &str, session_id: &str, response: &GenerateResponse) -> Vec<Message> {
    let mut messages = Vec::new();
    if let Some(content) = &response.content {
        if !content.is_empty() {
            messages.push(Message::AgentMessage {
                agent_id: agent_id.to_string(),
                session_id: session_id.to_string(),
                content: content.clone(),
                r#final: false,
            });
        }
    }
    if !response.tool_calls.is_empty() {
        messages.push(Message::ToolCallMessage {
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            tool_calls: response.tool_calls.clone(),
        });
    }
    messages.push(Message::UsageMessage {
        agent_id: agent_id.to_string(),
        session_id: session_id.to_string(),
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
        total_tokens: response.usage.total_tokens,
    });
    messages
}

/// Message-assembly contract after tool execution (spec §4.4): a synthetic
/// assistant message carrying the tool-call requests, followed by one
/// tool-result message per call summarizing its outcome.
pub fn format_tool_results(tool_calls: &[ToolCallRequest], results: &[(String, ToolResult)]) -> Vec<LLMMessage> {
    let mut messages = vec![LLMMessage::assistant_tool_calls(tool_calls.to_vec())];
    for (tool_id, result) in results {
        let Some(call) = tool_calls.iter().find(|c| &c.tool_id == tool_id) else {
            continue;
        };
        let summary = if result.success {
            format!("[{}] Success", call.tool_name)
        } else {
            let error_type = result.error_type.map(|t| format!("{t:?}")).unwrap_or_else(|| "unknown".to_string());
            format!("[{}] Error ({}): {}", call.tool_name, error_type, result.error.clone().unwrap_or_default())
        };
        messages.push(LLMMessage::tool_result(tool_id.clone(), summary));
    }
    messages
}

// ── Provider trait ───────────────────────────────────────────────────────────

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(
        &self,
        messages: &[LLMMessage],
        tools: &[ToolSpec],
        temperature: f32,
        max_tokens: u32,
    ) -> ProviderResult<GenerateResponse>;

    async fn generate_structured(&self, messages: &[LLMMessage], response_schema: &Value) -> ProviderResult<Value>;
}

/// Thin facade the rest of the core depends on. Owns exactly one provider;
/// provider selection happens once at construction, from `LlmConfig`.
pub struct LlmClient {
    provider: Box<dyn LlmProvider>,
    default_temperature: f32,
    default_max_tokens: u32,
}

impl LlmClient {
    pub fn new(provider: Box<dyn LlmProvider>) -> Self {
        Self { provider, default_temperature: 0.7, default_max_tokens: 4096 }
    }

    pub fn with_defaults(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.default_temperature = temperature;
        self.default_max_tokens = max_tokens;
        self
    }

    /// Builds the concrete provider named by `provider`/`model` in an
    /// `ambit_config::LlmConfig`. `"ollama"` and `"openrouter"` talk to the
    /// real services; anything else (including the default `"stub"`) falls
    /// back to a scripted provider that always errors until replaced by a
    /// test double — keeps a freshly-generated config runnable offline.
    pub fn from_provider_name(provider: &str, model: &str) -> Self {
        match provider {
            "ollama" => Self::new(Box::new(providers::OllamaProvider::new(model.to_string()))),
            "openrouter" => Self::new(Box::new(providers::OpenRouterProvider::new(model.to_string()))),
            _ => Self::new(Box::new(testing::ScriptedProvider::unavailable(provider.to_string()))),
        }
    }

    pub async fn generate(&self, messages: &[LLMMessage], tools: &[ToolSpec]) -> ProviderResult<GenerateResponse> {
        self.provider
            .generate(messages, tools, self.default_temperature, self.default_max_tokens)
            .await
    }

    pub async fn generate_stream(
        &self,
        agent_id: &str,
        session_id: &str,
        messages: &[LLMMessage],
        tools: &[ToolSpec],
    ) -> ProviderResult<Vec<Message>> {
        let response = self.generate(messages, tools).await?;
        Ok(response_to_messages(agent_id, session_id, &response))
    }

    pub async fn generate_structured(&self, messages: &[LLMMessage], response_schema: &Value) -> ProviderResult<Value> {
        self.provider.generate_structured(messages, response_schema).await
    }
}

// ── Concrete providers ───────────────────────────────────────────────────────

pub mod providers {
    use super::*;

    /// Talks to a local Ollama daemon via `/api/chat`.
    #[derive(Debug, Clone)]
    pub struct OllamaProvider {
        client: reqwest::Client,
        model: String,
    }

    impl OllamaProvider {
        pub fn new(model: String) -> Self {
            Self { client: reqwest::Client::new(), model }
        }

        fn base_url(&self) -> String {
            std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
        }
    }

    #[async_trait]
    impl LlmProvider for OllamaProvider {
        async fn generate(
            &self,
            messages: &[LLMMessage],
            tools: &[ToolSpec],
            _temperature: f32,
            _max_tokens: u32,
        ) -> ProviderResult<GenerateResponse> {
            let base_url = self.base_url();
            let endpoint = format!("{}/api/chat", base_url.trim_end_matches('/'));

            let mut payload = json!({
                "model": self.model,
                "messages": messages_to_ollama(messages),
                "stream": false,
            });
            if !tools.is_empty() {
                payload["tools"] = json!(tools.iter().map(tool_spec_to_ollama).collect::<Vec<_>>());
            }

            let response = self.client.post(&endpoint).json(&payload).send().await.map_err(|e| {
                ProviderError::Unavailable { provider: "ollama".to_string(), detail: e.to_string() }
            })?;
            let status = response.status();
            let body: Value = response.json().await.map_err(|e| ProviderError::MalformedResponse {
                provider: "ollama".to_string(),
                detail: e.to_string(),
            })?;
            if !status.is_success() {
                return Err(ProviderError::Http { provider: "ollama".to_string(), status: status.as_u16(), body: body.to_string() });
            }

            let content = body.get("message").and_then(|m| m.get("content")).and_then(|v| v.as_str()).map(str::to_string);
            let tool_calls = body
                .get("message")
                .and_then(|m| m.get("tool_calls"))
                .and_then(|v| v.as_array())
                .map(|calls| parse_ollama_tool_calls(calls))
                .unwrap_or_default();
            let usage = Usage {
                input_tokens: body.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
                output_tokens: body.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
                total_tokens: body.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0)
                    + body.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
            };

            Ok(GenerateResponse { content, tool_calls, usage })
        }

        async fn generate_structured(&self, messages: &[LLMMessage], response_schema: &Value) -> ProviderResult<Value> {
            let base_url = self.base_url();
            let endpoint = format!("{}/api/chat", base_url.trim_end_matches('/'));

            let payload = json!({
                "model": self.model,
                "messages": messages_to_ollama(messages),
                "stream": false,
                "format": response_schema,
            });

            let response = self.client.post(&endpoint).json(&payload).send().await.map_err(|e| {
                ProviderError::Unavailable { provider: "ollama".to_string(), detail: e.to_string() }
            })?;
            let status = response.status();
            let body: Value = response.json().await.map_err(|e| ProviderError::MalformedResponse {
                provider: "ollama".to_string(),
                detail: e.to_string(),
            })?;
            if !status.is_success() {
                return Err(ProviderError::Http { provider: "ollama".to_string(), status: status.as_u16(), body: body.to_string() });
            }
            let content = body.get("message").and_then(|m| m.get("content")).and_then(|v| v.as_str()).unwrap_or("");
            serde_json::from_str(content).map_err(|e| ProviderError::MalformedResponse {
                provider: "ollama".to_string(),
                detail: format!("structured output was not valid JSON matching the schema: {e}"),
            })
        }
    }

    /// Talks to OpenRouter's OpenAI-compatible `/chat/completions` endpoint.
    #[derive(Debug, Clone)]
    pub struct OpenRouterProvider {
        client: reqwest::Client,
        model: String,
    }

    impl OpenRouterProvider {
        pub fn new(model: String) -> Self {
            Self { client: reqwest::Client::new(), model }
        }

        fn api_key(&self) -> ProviderResult<String> {
            std::env::var("OPENROUTER_API_KEY").ok().filter(|k| !k.trim().is_empty()).ok_or_else(|| {
                ProviderError::Unavailable {
                    provider: "openrouter".to_string(),
                    detail: "OPENROUTER_API_KEY is not set".to_string(),
                }
            })
        }
    }

    #[async_trait]
    impl LlmProvider for OpenRouterProvider {
        async fn generate(
            &self,
            messages: &[LLMMessage],
            tools: &[ToolSpec],
            temperature: f32,
            max_tokens: u32,
        ) -> ProviderResult<GenerateResponse> {
            let api_key = self.api_key()?;
            let mut payload = json!({
                "model": self.model,
                "messages": messages_to_openai(messages),
                "temperature": temperature,
                "max_tokens": max_tokens,
            });
            if !tools.is_empty() {
                payload["tools"] = json!(tools.iter().map(tool_spec_to_openai).collect::<Vec<_>>());
            }

            let response = self
                .client
                .post("https://openrouter.ai/api/v1/chat/completions")
                .bearer_auth(api_key)
                .header("HTTP-Referer", "https://ambit.local")
                .header("X-Title", "ambit")
                .json(&payload)
                .send()
                .await
                .map_err(|e| ProviderError::Unavailable { provider: "openrouter".to_string(), detail: e.to_string() })?;

            let status = response.status();
            let body: Value = response.json().await.map_err(|e| ProviderError::MalformedResponse {
                provider: "openrouter".to_string(),
                detail: e.to_string(),
            })?;
            if !status.is_success() {
                return Err(ProviderError::Http { provider: "openrouter".to_string(), status: status.as_u16(), body: body.to_string() });
            }

            let choice = body.get("choices").and_then(|c| c.get(0));
            let message = choice.and_then(|c| c.get("message"));
            let content = message.and_then(|m| m.get("content")).and_then(|v| v.as_str()).map(str::to_string);
            let tool_calls = message
                .and_then(|m| m.get("tool_calls"))
                .and_then(|v| v.as_array())
                .map(|calls| parse_openai_tool_calls(calls))
                .unwrap_or_default();
            let usage_obj = body.get("usage");
            let usage = Usage {
                input_tokens: usage_obj.and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
                output_tokens: usage_obj.and_then(|u| u.get("completion_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
                total_tokens: usage_obj.and_then(|u| u.get("total_tokens")).and_then(|v| v.as_u64()).unwrap_or(0),
            };

            Ok(GenerateResponse { content, tool_calls, usage })
        }

        async fn generate_structured(&self, messages: &[LLMMessage], response_schema: &Value) -> ProviderResult<Value> {
            let api_key = self.api_key()?;
            let payload = json!({
                "model": self.model,
                "messages": messages_to_openai(messages),
                "response_format": {
                    "type": "json_schema",
                    "json_schema": { "name": "response", "schema": response_schema, "strict": true },
                },
            });

            let response = self
                .client
                .post("https://openrouter.ai/api/v1/chat/completions")
                .bearer_auth(api_key)
                .header("HTTP-Referer", "https://ambit.local")
                .header("X-Title", "ambit")
                .json(&payload)
                .send()
                .await
                .map_err(|e| ProviderError::Unavailable { provider: "openrouter".to_string(), detail: e.to_string() })?;

            let status = response.status();
            let body: Value = response.json().await.map_err(|e| ProviderError::MalformedResponse {
                provider: "openrouter".to_string(),
                detail: e.to_string(),
            })?;
            if !status.is_success() {
                return Err(ProviderError::Http { provider: "openrouter".to_string(), status: status.as_u16(), body: body.to_string() });
            }
            let content = body
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            serde_json::from_str(content).map_err(|e| ProviderError::MalformedResponse {
                provider: "openrouter".to_string(),
                detail: format!("structured output was not valid JSON matching the schema: {e}"),
            })
        }
    }

    fn messages_to_ollama(messages: &[LLMMessage]) -> Vec<Value> {
        messages.iter().map(message_to_generic).collect()
    }

    fn messages_to_openai(messages: &[LLMMessage]) -> Vec<Value> {
        messages.iter().map(message_to_generic).collect()
    }

    fn message_to_generic(m: &LLMMessage) -> Value {
        let role = match m.role {
            LlmRole::System => "system",
            LlmRole::User => "user",
            LlmRole::Assistant => "assistant",
            LlmRole::Tool => "tool",
        };
        let mut value = json!({ "role": role });
        if let Some(content) = &m.content {
            value["content"] = json!(content);
        }
        if !m.tool_calls.is_empty() {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.tool_id,
                        "type": "function",
                        "function": { "name": tc.tool_name, "arguments": tc.tool_args.to_string() },
                    })
                })
                .collect();
            value["tool_calls"] = json!(calls);
        }
        if let Some(id) = &m.tool_call_id {
            value["tool_call_id"] = json!(id);
        }
        value
    }

    fn tool_spec_to_ollama(spec: &ToolSpec) -> Value {
        json!({
            "type": "function",
            "function": { "name": spec.name, "description": spec.description, "parameters": spec.input_schema },
        })
    }

    fn tool_spec_to_openai(spec: &ToolSpec) -> Value {
        tool_spec_to_ollama(spec)
    }

    fn parse_ollama_tool_calls(calls: &[Value]) -> Vec<ToolCallRequest> {
        calls
            .iter()
            .enumerate()
            .filter_map(|(i, call)| {
                let func = call.get("function")?;
                let tool_name = func.get("name")?.as_str()?.to_string();
                let tool_args = func.get("arguments").cloned().unwrap_or_else(|| json!({}));
                Some(ToolCallRequest { tool_id: format!("call_{i}"), tool_name, tool_args })
            })
            .collect()
    }

    fn parse_openai_tool_calls(calls: &[Value]) -> Vec<ToolCallRequest> {
        calls
            .iter()
            .enumerate()
            .filter_map(|(i, call)| {
                let func = call.get("function")?;
                let tool_name = func.get("name")?.as_str()?.to_string();
                let tool_id = call.get("id").and_then(|v| v.as_str()).map(str::to_string).unwrap_or_else(|| format!("call_{i}"));
                let raw_args = func.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}");
                let tool_args = serde_json::from_str(raw_args).unwrap_or_else(|_| json!({}));
                Some(ToolCallRequest { tool_id, tool_name, tool_args })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambit_tools::ToolErrorType;

    #[test]
    fn format_tool_results_summarizes_success_and_error() {
        let calls = vec![
            ToolCallRequest { tool_id: "1".into(), tool_name: "read_file".into(), tool_args: json!({}) },
            ToolCallRequest { tool_id: "2".into(), tool_name: "run_shell".into(), tool_args: json!({}) },
        ];
        let results = vec![
            ("1".to_string(), ToolResult::ok("hi")),
            ("2".to_string(), ToolResult::err(ToolErrorType::ExecutionError, "boom")),
        ];

        let messages = format_tool_results(&calls, &results);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content.as_deref(), Some("[read_file] Success"));
        assert_eq!(messages[2].content.as_deref(), Some("[run_shell] Error (ExecutionError): boom"));
    }

    #[test]
    fn response_to_messages_emits_content_then_usage() {
        let response = GenerateResponse {
            content: Some("hello".to_string()),
            tool_calls: vec![],
            usage: Usage { input_tokens: 10, output_tokens: 5, total_tokens: 15 },
        };
        let messages = response_to_messages("meta", "session-1", &response);
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], Message::AgentMessage { .. }));
        assert!(matches!(messages[1], Message::UsageMessage { .. }));
    }

    #[test]
    fn response_to_messages_includes_tool_call_message_when_present() {
        let response = GenerateResponse {
            content: None,
            tool_calls: vec![ToolCallRequest { tool_id: "1".into(), tool_name: "read_file".into(), tool_args: json!({}) }],
            usage: Usage::default(),
        };
        let messages = response_to_messages("meta", "session-1", &response);
        assert!(matches!(messages[0], Message::ToolCallMessage { .. }));
    }

    #[test]
    fn mark_final_only_affects_agent_message() {
        let mut m = Message::ThinkingMessage { agent_id: "a".into(), session_id: "s".into(), content: "x".into() };
        m.mark_final();
        assert!(!m.is_final_agent_message());

        let mut m = Message::AgentMessage { agent_id: "a".into(), session_id: "s".into(), content: "x".into(), r#final: false };
        m.mark_final();
        assert!(m.is_final_agent_message());
    }
}
