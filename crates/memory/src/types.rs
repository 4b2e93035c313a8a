//! Persisted entity types for the Memory Store (conversation turns, tool
//! usage, task configs, compact memories) plus the storage error taxonomy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── ConversationTurn ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationType {
    UserAgent,
    AgentAgent,
    SystemMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    InProgress,
    Completed,
    Error,
    Partial,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    pub agent_id: String,
    pub session_id: String,
    pub turn_number: u64,
    pub timestamp: DateTime<Utc>,
    pub source_entity: String,
    pub target_entity: String,
    pub conversation_type: ConversationType,
    pub user_query: String,
    pub agent_response: Option<String>,
    pub task_id: Option<String>,
    pub total_duration_ms: Option<u64>,
    pub llm_duration_ms: Option<u64>,
    pub tools_duration_ms: Option<u64>,
    #[serde(default)]
    pub user_metadata: HashMap<String, Value>,
    #[serde(default)]
    pub agent_metadata: HashMap<String, Value>,
    pub status: TurnStatus,
    pub error_details: Option<Value>,
    pub tools_used: bool,
    pub compacted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationTurn {
    /// Construct a fresh `in_progress` turn; `turn_number` is assigned by the
    /// store via `next_turn_number` before this is handed to `store_turn`.
    pub fn new_in_progress(
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        turn_number: u64,
        source_entity: impl Into<String>,
        target_entity: impl Into<String>,
        conversation_type: ConversationType,
        user_query: impl Into<String>,
        task_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            turn_number,
            timestamp: now,
            source_entity: source_entity.into(),
            target_entity: target_entity.into(),
            conversation_type,
            user_query: user_query.into(),
            agent_response: None,
            task_id,
            total_duration_ms: None,
            llm_duration_ms: None,
            tools_duration_ms: None,
            user_metadata: HashMap::new(),
            agent_metadata: HashMap::new(),
            status: TurnStatus::InProgress,
            error_details: None,
            tools_used: false,
            compacted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied to a stored [`ConversationTurn`]. Every field left
/// `None` is left untouched.
#[derive(Debug, Clone, Default)]
pub struct TurnPatch {
    pub agent_response: Option<String>,
    pub total_duration_ms: Option<u64>,
    pub llm_duration_ms: Option<u64>,
    pub tools_duration_ms: Option<u64>,
    pub agent_metadata: Option<HashMap<String, Value>>,
    pub status: Option<TurnStatus>,
    pub error_details: Option<Value>,
    pub tools_used: Option<bool>,
    pub compacted: Option<bool>,
}

impl TurnPatch {
    pub fn apply(&self, turn: &mut ConversationTurn) {
        if let Some(v) = &self.agent_response {
            turn.agent_response = Some(v.clone());
        }
        if let Some(v) = self.total_duration_ms {
            turn.total_duration_ms = Some(v);
        }
        if let Some(v) = self.llm_duration_ms {
            turn.llm_duration_ms = Some(v);
        }
        if let Some(v) = self.tools_duration_ms {
            turn.tools_duration_ms = Some(v);
        }
        if let Some(v) = &self.agent_metadata {
            turn.agent_metadata = v.clone();
        }
        if let Some(v) = self.status {
            turn.status = v;
        }
        if let Some(v) = &self.error_details {
            turn.error_details = Some(v.clone());
        }
        if let Some(v) = self.tools_used {
            turn.tools_used = v;
        }
        if let Some(v) = self.compacted {
            turn.compacted = v;
        }
        turn.updated_at = Utc::now();
    }
}

// ── ToolUsage ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserDecision {
    Approved,
    Rejected,
}

/// Preserve these exact, case-sensitive string values across any rewrite —
/// they are part of the on-disk schema (spec design note, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    PendingApproval,
    Approved,
    Rejected,
    Executing,
    Completed,
    Failed,
    Abandoned,
}

impl ExecutionStatus {
    /// Statuses a crash can leave dangling; the recovery sweep rewrites
    /// these to `Abandoned`.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending
                | ExecutionStatus::PendingApproval
                | ExecutionStatus::Executing
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUsage {
    pub id: String,
    pub turn_id: String,
    pub agent_id: String,
    pub tool_name: String,
    pub tool_args: Value,
    pub tool_call_id: Option<String>,
    pub requires_approval: bool,
    pub user_decision: Option<UserDecision>,
    pub user_feedback: Option<String>,
    pub decision_at: Option<DateTime<Utc>>,
    pub execution_started_at: Option<DateTime<Utc>>,
    pub execution_completed_at: Option<DateTime<Utc>>,
    pub execution_status: ExecutionStatus,
    pub execution_result: Option<Value>,
    pub execution_error: Option<String>,
    pub duration_ms: Option<u64>,
    pub tokens_used: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl ToolUsage {
    pub fn new(
        turn_id: impl Into<String>,
        agent_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args: Value,
        tool_call_id: Option<String>,
        requires_approval: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            turn_id: turn_id.into(),
            agent_id: agent_id.into(),
            tool_name: tool_name.into(),
            tool_args,
            tool_call_id,
            requires_approval,
            user_decision: None,
            user_feedback: None,
            decision_at: None,
            execution_started_at: None,
            execution_completed_at: None,
            execution_status: if requires_approval {
                ExecutionStatus::PendingApproval
            } else {
                ExecutionStatus::Pending
            },
            execution_result: None,
            execution_error: None,
            duration_ms: None,
            tokens_used: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolUsagePatch {
    pub user_decision: Option<UserDecision>,
    pub user_feedback: Option<String>,
    pub decision_at: Option<DateTime<Utc>>,
    pub execution_started_at: Option<DateTime<Utc>>,
    pub execution_completed_at: Option<DateTime<Utc>>,
    pub execution_status: Option<ExecutionStatus>,
    pub execution_result: Option<Value>,
    pub execution_error: Option<String>,
    pub duration_ms: Option<u64>,
    pub tokens_used: Option<u64>,
}

impl ToolUsagePatch {
    pub fn apply(&self, usage: &mut ToolUsage) {
        if let Some(v) = self.user_decision {
            usage.user_decision = Some(v);
        }
        if let Some(v) = &self.user_feedback {
            usage.user_feedback = Some(v.clone());
        }
        if let Some(v) = self.decision_at {
            usage.decision_at = Some(v);
        }
        if let Some(v) = self.execution_started_at {
            usage.execution_started_at = Some(v);
        }
        if let Some(v) = self.execution_completed_at {
            usage.execution_completed_at = Some(v);
        }
        if let Some(v) = self.execution_status {
            usage.execution_status = v;
        }
        if let Some(v) = &self.execution_result {
            usage.execution_result = Some(v.clone());
        }
        if let Some(v) = &self.execution_error {
            usage.execution_error = Some(v.clone());
        }
        if let Some(v) = self.duration_ms {
            usage.duration_ms = Some(v);
        }
        if let Some(v) = self.tokens_used {
            usage.tokens_used = Some(v);
        }
    }
}

// ── TaskConfig ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Float,
    Boolean,
    List,
    Dict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub description: String,
    /// Template using `{param}` placeholders, substituted from `input_values`.
    pub instructions: String,
    pub input_schema: Vec<Parameter>,
    #[serde(default)]
    pub output_schema: Vec<Parameter>,
    pub task_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    pub name: String,
    pub definition: TaskDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskConfig {
    pub fn new(definition: TaskDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: definition.name.clone(),
            definition,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── CompactMemory ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactMemory {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Storage column is `task_ids` in the current revision (spec §9 open
    /// question: the source's `session_ids`/`task_ids` naming drifted across
    /// layers; this is the one the spec treats as authoritative).
    pub task_ids: Vec<String>,
    pub summary: String,
    pub key_points: Vec<String>,
    pub entities: Vec<String>,
    pub semantic_labels: Vec<String>,
    pub turn_count: u64,
    pub token_count: u64,
    pub compressed_token_count: u64,
    pub processed: bool,
}

// ── Errors ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Locked,
    Corrupt,
    Integrity,
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage locked: {0}")]
    Locked(String),
    #[error("storage corrupt: {0}")]
    Corrupt(String),
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("storage error: {0}")]
    Unknown(String),
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::Locked(_) => StorageErrorKind::Locked,
            StorageError::Corrupt(_) => StorageErrorKind::Corrupt,
            StorageError::Integrity(_) => StorageErrorKind::Integrity,
            StorageError::Unknown(_) => StorageErrorKind::Unknown,
        }
    }
}

fn classify_message(msg: &str) -> StorageError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("lock") {
        StorageError::Locked(msg.to_string())
    } else if lower.contains("corrupt") || lower.contains("checksum") {
        StorageError::Corrupt(msg.to_string())
    } else {
        StorageError::Unknown(msg.to_string())
    }
}

impl From<redb::Error> for StorageError {
    fn from(e: redb::Error) -> Self {
        classify_message(&e.to_string())
    }
}

impl From<redb::DatabaseError> for StorageError {
    fn from(e: redb::DatabaseError) -> Self {
        classify_message(&e.to_string())
    }
}

impl From<redb::TransactionError> for StorageError {
    fn from(e: redb::TransactionError) -> Self {
        classify_message(&e.to_string())
    }
}

impl From<redb::TableError> for StorageError {
    fn from(e: redb::TableError) -> Self {
        classify_message(&e.to_string())
    }
}

impl From<redb::StorageError> for StorageError {
    fn from(e: redb::StorageError) -> Self {
        classify_message(&e.to_string())
    }
}

impl From<redb::CommitError> for StorageError {
    fn from(e: redb::CommitError) -> Self {
        classify_message(&e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Corrupt(format!("json decode failed: {e}"))
    }
}
