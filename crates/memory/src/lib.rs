pub mod retry;
pub mod store;
pub mod types;

pub use retry::with_retry;
pub use store::{MemoryStore, RecoveryReport};
pub use types::{
    CompactMemory, ConversationTurn, ConversationType, ExecutionStatus, ParamType, Parameter,
    StorageError, StorageErrorKind, TaskConfig, TaskDefinition, ToolUsage, ToolUsagePatch,
    TurnPatch, TurnStatus, UserDecision,
};
