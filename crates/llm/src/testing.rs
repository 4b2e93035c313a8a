//! Test-only LLM provider: returns a pre-scripted sequence of responses
//! instead of calling a real service. Used by the tool-loop, agent, and
//! router test suites to drive deterministic scenarios (spec §8).

use std::sync::Mutex;

use ambit_tools::ToolSpec;
use async_trait::async_trait;
use serde_json::Value;

use crate::{GenerateResponse, LLMMessage, LlmProvider, ProviderError, ProviderResult};

/// Plays back a fixed list of `GenerateResponse`s, one per `generate` call.
/// Exhausting the script is a test-authoring bug, not a recoverable runtime
/// condition, so the next call after the last scripted response panics.
pub struct ScriptedProvider {
    script: Mutex<Vec<GenerateResponse>>,
    structured_script: Mutex<Vec<Value>>,
    unavailable: Option<String>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<GenerateResponse>) -> Self {
        Self { script: Mutex::new(script), structured_script: Mutex::new(Vec::new()), unavailable: None }
    }

    pub fn with_structured(mut self, structured_script: Vec<Value>) -> Self {
        self.structured_script = Mutex::new(structured_script);
        self
    }

    /// A provider that always fails with `ProviderError::Unavailable`, used
    /// as the fallback for an unrecognized `LlmConfig::provider` name so a
    /// freshly generated config is inert rather than panicking at startup.
    pub fn unavailable(provider_name: String) -> Self {
        Self { script: Mutex::new(Vec::new()), structured_script: Mutex::new(Vec::new()), unavailable: Some(provider_name) }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(
        &self,
        _messages: &[LLMMessage],
        _tools: &[ToolSpec],
        _temperature: f32,
        _max_tokens: u32,
    ) -> ProviderResult<GenerateResponse> {
        if let Some(provider) = &self.unavailable {
            return Err(ProviderError::Unavailable {
                provider: provider.clone(),
                detail: "no scripted or real provider is configured".to_string(),
            });
        }
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            panic!("ScriptedProvider script exhausted: generate() called more times than scripted");
        }
        Ok(script.remove(0))
    }

    async fn generate_structured(&self, _messages: &[LLMMessage], _response_schema: &Value) -> ProviderResult<Value> {
        if let Some(provider) = &self.unavailable {
            return Err(ProviderError::Unavailable {
                provider: provider.clone(),
                detail: "no scripted or real provider is configured".to_string(),
            });
        }
        let mut script = self.structured_script.lock().unwrap();
        if script.is_empty() {
            panic!("ScriptedProvider structured script exhausted: generate_structured() called more times than scripted");
        }
        Ok(script.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Usage;

    #[tokio::test]
    async fn plays_back_responses_in_order() {
        let provider = ScriptedProvider::new(vec![
            GenerateResponse { content: Some("first".to_string()), tool_calls: vec![], usage: Usage::default() },
            GenerateResponse { content: Some("second".to_string()), tool_calls: vec![], usage: Usage::default() },
        ]);

        let first = provider.generate(&[], &[], 0.0, 0).await.unwrap();
        assert_eq!(first.content.as_deref(), Some("first"));
        let second = provider.generate(&[], &[], 0.0, 0).await.unwrap();
        assert_eq!(second.content.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn unavailable_provider_errors_instead_of_panicking() {
        let provider = ScriptedProvider::unavailable("stub".to_string());
        let err = provider.generate(&[], &[], 0.0, 0).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }

    #[tokio::test]
    #[should_panic(expected = "script exhausted")]
    async fn exhausted_script_panics() {
        let provider = ScriptedProvider::new(vec![]);
        let _ = provider.generate(&[], &[], 0.0, 0).await;
    }
}
