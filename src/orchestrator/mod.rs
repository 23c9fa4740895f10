//! Query orchestration — message preparation and the model/tool loop.

pub mod formatter;
pub mod processor;

pub use formatter::{
    chunk_history, format_query, format_tool_call, format_tool_result, prepare_messages,
    ContextConfig, Turn, TurnRole,
};
pub use processor::{OrchestratorConfig, OrchestratorError, QueryOrchestrator, QueryState};
