//! Tool trait and closure-based tool wrapper.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::types::{ToolDefinition, ToolParameters};
use crate::error::TurnstileError;
use crate::run::confirmation::{ConfirmationDetail, ConfirmationHandle, Decision};
use crate::run::types::{ConversationId, RunId};

/// Denial reason when a tool runs without a confirmation capability.
pub const CONFIRMATION_UNAVAILABLE: &str = "confirmation unavailable";

/// Context available during tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: ConversationId,
    pub run_id: RunId,
    pub tool_call_id: String,
    /// Fires when the owning run is hard-stopped.
    pub cancellation: CancellationToken,
    pub confirmation: Option<ConfirmationHandle>,
}

impl ToolContext {
    /// Context with no confirmation capability and a fresh token.
    pub fn detached(conversation_id: impl Into<ConversationId>, run_id: RunId) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            run_id,
            tool_call_id: String::new(),
            cancellation: CancellationToken::new(),
            confirmation: None,
        }
    }

    /// Ask the user to approve `action` on `target`.
    ///
    /// Without a confirmation capability the request is denied.
    pub async fn request_confirmation(
        &self,
        action: impl Into<String>,
        target: impl Into<String>,
        detail: ConfirmationDetail,
    ) -> Decision {
        match &self.confirmation {
            Some(handle) => handle.request(action, target, detail).await,
            None => Decision::deny(CONFIRMATION_UNAVAILABLE),
        }
    }
}

/// Core tool trait. Implement it to create custom tools.
///
/// Tools return text. Side-effecting tools must ask for confirmation first
/// and report a denial as an `Ok` result rather than an error.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema parameters.
    fn parameters(&self) -> &ToolParameters;

    /// Execute the tool with parsed arguments.
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<String, TurnstileError>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters().schema.clone(),
        }
    }
}

/// Type alias for the tool handler function.
type ToolHandler =
    dyn Fn(ToolArguments, ToolContext) -> BoxFuture<'static, Result<String, TurnstileError>> + Send + Sync;

/// Closure-based tool for quick tool creation.
pub struct AgentTool {
    name: String,
    description: String,
    parameters: ToolParameters,
    handler: Arc<ToolHandler>,
}

impl AgentTool {
    /// Create a tool from a closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, TurnstileError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<String, TurnstileError> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}
