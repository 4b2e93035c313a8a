pub mod protocol;
pub mod supervisor;
pub mod transport;

pub use protocol::{ToolCallContent, ToolCallResult, ToolDef, ToolsListResult};
pub use supervisor::{restart_backoff, ServerConfig, ServerState, SupervisorError, ToolServerSupervisor};
pub use transport::{StdioTransport, TransportError};
