//! One step: a model decision plus the tool calls it asked for.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::model::{AgentModel, Message, ModelDecision, ToolCall};
use crate::run::confirmation::{
    ConfirmationGate, ConfirmationHandle, ConfirmationObserver, ConfirmationScope,
};
use crate::run::events::{RunUpdatePayload, UpdateEmitter};
use crate::run::types::{ConversationId, RunId};
use crate::tools::{ToolArguments, ToolContext, ToolRegistry};
use crate::util::with_optional_timeout;

/// Result text for tool calls skipped because the run was hard-stopped.
pub const SKIPPED_CANCELLED: &str = "Skipped: run cancelled";

/// How a step ended, plus the transcript entries it produced.
#[derive(Debug)]
pub(crate) enum StepOutcome {
    /// Tools ran; the model wants another step.
    Continue { messages: Vec<Message> },
    /// The model produced its final answer.
    Final { messages: Vec<Message> },
    /// The run's cancellation fired before the step could finish normally.
    Cancelled { messages: Vec<Message> },
    /// The model call failed in a way that ends the run.
    Failed { error: String },
}

pub(crate) struct StepContext {
    pub conversation_id: ConversationId,
    pub run_id: RunId,
    pub step: usize,
    pub transcript: Vec<Message>,
    pub model: Arc<dyn AgentModel>,
    pub tools: ToolRegistry,
    pub cancellation: CancellationToken,
    pub gate: Arc<ConfirmationGate>,
    pub observer: ConfirmationObserver,
    pub emitter: Arc<UpdateEmitter>,
    pub step_timeout: Option<Duration>,
}

/// Run one step. A panic outside the tool calls (the model side) fails the run.
pub(crate) async fn execute(ctx: StepContext) -> StepOutcome {
    let run_id = ctx.run_id;
    match AssertUnwindSafe(run_step(ctx)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::warn!(run_id = %run_id, "step panicked");
            StepOutcome::Failed {
                error: "step panicked".into(),
            }
        }
    }
}

async fn run_step(ctx: StepContext) -> StepOutcome {
    let definitions = ctx.tools.definitions();
    let decided = tokio::select! {
        biased;
        _ = ctx.cancellation.cancelled() => {
            return StepOutcome::Cancelled { messages: Vec::new() };
        }
        decided = with_optional_timeout(
            ctx.step_timeout,
            ctx.model.decide(&ctx.transcript, &definitions),
        ) => decided,
    };

    let decision = match decided {
        Ok(decision) => decision,
        Err(err) if err.ends_run() => {
            tracing::warn!(
                run_id = %ctx.run_id,
                step = ctx.step,
                model = ctx.model.name(),
                error = %err,
                "model call failed"
            );
            return StepOutcome::Failed {
                error: err.to_string(),
            };
        }
        Err(err) => {
            // Recoverable: let the model see what went wrong.
            return StepOutcome::Continue {
                messages: vec![Message::system(format!("Error: {err}"))],
            };
        }
    };

    match decision {
        ModelDecision::Final { text } => {
            emit(&ctx, RunUpdatePayload::AssistantText { text: text.clone() });
            StepOutcome::Final {
                messages: vec![Message::assistant(text)],
            }
        }
        ModelDecision::UseTools { text, calls, .. } if calls.is_empty() => {
            let text = text.unwrap_or_default();
            emit(&ctx, RunUpdatePayload::AssistantText { text: text.clone() });
            StepOutcome::Final {
                messages: vec![Message::assistant(text)],
            }
        }
        ModelDecision::UseTools {
            text,
            reasoning,
            calls,
        } => {
            if let Some(reasoning) = reasoning.filter(|r| !r.is_empty()) {
                emit(&ctx, RunUpdatePayload::Reasoning { text: reasoning });
            }
            if let Some(text) = text.as_ref().filter(|t| !t.is_empty()) {
                emit(&ctx, RunUpdatePayload::AssistantText { text: text.clone() });
            }

            let mut messages = vec![Message::assistant_with_calls(
                text.unwrap_or_default(),
                calls.clone(),
            )];
            for call in &calls {
                let output = if ctx.cancellation.is_cancelled() {
                    emit(
                        &ctx,
                        RunUpdatePayload::ToolFinished {
                            call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            output: SKIPPED_CANCELLED.into(),
                            is_error: true,
                        },
                    );
                    SKIPPED_CANCELLED.to_string()
                } else {
                    run_tool(&ctx, call).await
                };
                messages.push(Message::tool_result(call.id.clone(), output));
            }

            if ctx.cancellation.is_cancelled() {
                StepOutcome::Cancelled { messages }
            } else {
                StepOutcome::Continue { messages }
            }
        }
    }
}

async fn run_tool(ctx: &StepContext, call: &ToolCall) -> String {
    emit(
        ctx,
        RunUpdatePayload::ToolStarted {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        },
    );

    let (output, is_error) = match ctx.tools.get(&call.name) {
        None => (format!("Error: tool '{}' not found", call.name), true),
        Some(tool) => {
            let scope = ConfirmationScope::new(ctx.run_id, ctx.cancellation.clone())
                .with_observer(ctx.observer.clone());
            let tool_ctx = ToolContext {
                conversation_id: ctx.conversation_id.clone(),
                run_id: ctx.run_id,
                tool_call_id: call.id.clone(),
                cancellation: ctx.cancellation.clone(),
                confirmation: Some(ConfirmationHandle::new(ctx.gate.clone(), scope)),
            };
            let args = ToolArguments::new(call.arguments.clone());
            match AssertUnwindSafe(tool.execute(&args, &tool_ctx))
                .catch_unwind()
                .await
            {
                Ok(Ok(text)) => (text, false),
                Ok(Err(err)) => {
                    tracing::debug!(
                        run_id = %ctx.run_id,
                        tool = %call.name,
                        error = %err,
                        "tool failed"
                    );
                    (format!("Error: {err}"), true)
                }
                Err(_) => {
                    tracing::warn!(run_id = %ctx.run_id, tool = %call.name, "tool panicked");
                    (format!("Error: tool '{}' panicked", call.name), true)
                }
            }
        }
    };

    emit(
        ctx,
        RunUpdatePayload::ToolFinished {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output: output.clone(),
            is_error,
        },
    );
    output
}

fn emit(ctx: &StepContext, payload: RunUpdatePayload) {
    ctx.emitter.emit(Some(ctx.run_id), payload);
}
