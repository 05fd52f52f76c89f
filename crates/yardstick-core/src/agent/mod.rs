//! Agent adapter interface for the coding agents under evaluation.
//!
//! ```text
//! Orchestrator / judge evaluator
//!     |
//!     v
//! AdapterRegistry --get("claude-code")--> Arc<dyn AgentAdapter>
//!                                              |
//!     check_availability(config) -> bool ------+
//!     execute(ExecutionContext) -> AgentExecutionResult
//!     normalize_log(raw, result) -> NormalizedLog
//! ```

pub mod claude_code;
pub mod command;
pub mod registry;
pub mod trait_def;
pub mod types;

pub use claude_code::ClaudeCodeAdapter;
pub use command::CommandAdapter;
pub use registry::AdapterRegistry;
pub use trait_def::AgentAdapter;
pub use types::{
    AgentError, AgentExecutionResult, AgentStatus, ExecutionContext, LogMessage, NormalizedLog,
    TokenUsage, ToolCall,
};
