//! Model seam: one decision per step.

pub mod message;
pub mod scripted;

pub use message::{Message, Role, ToolCall};
pub use scripted::{ScriptedModel, ScriptedStep};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TurnstileError;
use crate::tools::ToolDefinition;

/// What the model wants to do next.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelDecision {
    /// The run is done; `text` is the final answer.
    Final { text: String },
    /// Run these tools and call back with their results.
    UseTools {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        calls: Vec<ToolCall>,
    },
}

/// Provider-facing side of a step.
///
/// Implementations must not retain state about the conversation between
/// calls: the driver passes the full transcript every time.
#[async_trait]
pub trait AgentModel: Send + Sync {
    /// Name used in logs and provider errors.
    fn name(&self) -> &str;

    /// Decide the next action for the given transcript.
    async fn decide(
        &self,
        transcript: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ModelDecision, TurnstileError>;
}
