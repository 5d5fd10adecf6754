//! Observable run updates forwarded to the session endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::confirmation::ConfirmationRequest;
use super::types::{ClientMessageId, ConfirmationId, ConversationId, InterruptMode, RunId, StopReason};

/// Stream category for updates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStream {
    Lifecycle,
    Assistant,
    Reasoning,
    Tool,
    Confirmation,
    Queue,
}

/// Concrete update payloads emitted by a driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunUpdatePayload {
    RunStarted {
        client_message_id: ClientMessageId,
    },
    StepStarted {
        step: usize,
    },
    AssistantText {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolStarted {
        call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    ConfirmationRequested {
        request: ConfirmationRequest,
    },
    ConfirmationResolved {
        id: ConfirmationId,
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    StopRequested {
        mode: InterruptMode,
    },
    RunStopped {
        reason: StopReason,
        queued: usize,
    },
    RunCompleted,
    RunError {
        error: String,
    },
    /// Queued follow-ups dropped by a hard stop or reset.
    QueueDiscarded {
        count: usize,
    },
    Reset,
}

impl RunUpdatePayload {
    pub fn stream(&self) -> UpdateStream {
        match self {
            Self::AssistantText { .. } => UpdateStream::Assistant,
            Self::Reasoning { .. } => UpdateStream::Reasoning,
            Self::ToolStarted { .. } | Self::ToolFinished { .. } => UpdateStream::Tool,
            Self::ConfirmationRequested { .. } | Self::ConfirmationResolved { .. } => {
                UpdateStream::Confirmation
            }
            Self::QueueDiscarded { .. } => UpdateStream::Queue,
            _ => UpdateStream::Lifecycle,
        }
    }
}

/// Envelope for streaming run updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunUpdate {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: UpdateStream,
    pub payload: RunUpdatePayload,
}

/// Callback used for streaming run updates.
pub type UpdateSink = Arc<dyn Fn(RunUpdate) + Send + Sync>;

/// Stamps payloads with the conversation id and a per-conversation sequence.
pub(crate) struct UpdateEmitter {
    conversation_id: ConversationId,
    seq: AtomicU64,
    sink: Option<UpdateSink>,
}

impl UpdateEmitter {
    pub(crate) fn new(conversation_id: ConversationId, sink: Option<UpdateSink>) -> Self {
        Self {
            conversation_id,
            seq: AtomicU64::new(1),
            sink,
        }
    }

    pub(crate) fn emit(&self, run_id: Option<RunId>, payload: RunUpdatePayload) {
        let Some(sink) = &self.sink else {
            return;
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        (sink)(RunUpdate {
            conversation_id: self.conversation_id.clone(),
            run_id,
            seq,
            timestamp: Utc::now(),
            stream: payload.stream(),
            payload,
        });
    }
}
