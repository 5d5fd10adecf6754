//! Convenience re-exports for common use.

pub use crate::config::TurnstileConfig;
pub use crate::error::{Result, TurnstileError};
pub use crate::model::{AgentModel, Message, ModelDecision, Role, ScriptedModel, ScriptedStep, ToolCall};
pub use crate::run::{
    Decision, Dispatch, DriverEnv, DriverHandle, DriverSnapshot, InterruptMode, QueuedMessage,
    RunDriver, RunState, RunUpdate, RunUpdatePayload, StopReason,
};
pub use crate::session::RunCoordinator;
pub use crate::tools::{AgentTool, Tool, ToolArguments, ToolContext, ToolParameters, ToolRegistry};
