use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Budgets and thresholds governing the agentic tool loop (spec §4.5 / §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolLoopConfig {
    /// One iteration = one LLM round-trip.
    pub max_iterations: u32,
    pub max_tools_per_turn: u32,
    /// Per fingerprint (`tool_name` + canonical args) cap before `loop_detected`.
    pub max_repeated_calls: u32,
    /// Aggregate token cap per turn, summed across all LLM calls.
    pub max_token_budget: u64,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_tools_per_turn: 100,
            max_repeated_calls: 5,
            max_token_budget: 1_000_000,
        }
    }
}

/// Subprocess tool-server supervisor tuning (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub health_interval_s: u64,
    pub max_restarts: u32,
    /// Hard deadline for any single health probe.
    pub probe_timeout_s: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_s: 30,
            max_restarts: 5,
            probe_timeout_s: 5,
        }
    }
}

/// Memory Store location and behavior (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Path to the redb database file.
    pub db_path: String,
    /// Mutating-call retry attempts on transient lock/contention errors.
    pub retry_attempts: u32,
    /// Backoff base in milliseconds; doubled per attempt, capped at `retry_max_backoff_ms`.
    pub retry_base_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: ".ambit/store.redb".to_string(),
            retry_attempts: 3,
            retry_base_backoff_ms: 50,
            retry_max_backoff_ms: 5_000,
        }
    }
}

/// Process-wide disabled tool set (spec §4.2, used to pull memory-related
/// tools out of rotation during migrations without unregistering them).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DisabledToolsConfig {
    pub disabled_tools: HashSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "stub".to_string(),
            model: "default".to_string(),
        }
    }
}

/// One subprocess tool server to bring up at Router start (spec §4.3/§4.7).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolServerEntry {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub tool_loop: ToolLoopConfig,
    pub supervisor: SupervisorConfig,
    pub memory: MemoryConfig,
    pub disabled_tools: DisabledToolsConfig,
    pub llm: LlmConfig,
    pub tool_servers: Vec<ToolServerEntry>,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}
