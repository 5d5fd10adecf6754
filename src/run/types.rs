//! Identifiers and small value types shared by the run modules.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Unique run identifier.
pub type RunId = Uuid;

/// Conversation identifier supplied by the session endpoint.
pub type ConversationId = String;

/// Id of the user message that started (or will start) a run.
pub type ClientMessageId = String;

/// Correlation id for one confirmation request.
pub type ConfirmationId = String;

/// How the current run has been asked to stop.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopMode {
    #[default]
    None,
    /// Finish the current step, then hand off to queued input.
    Soft,
    /// Cancel now and discard queued input. Sticky for the rest of the run.
    Hard,
}

/// Why a run ended up in `Stopped`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    UserStop,
    SoftInterrupt,
    Error,
}

/// A follow-up message waiting for the active run to settle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Run id the client proposed for the follow-up.
    pub run_id: RunId,
    pub client_message_id: ClientMessageId,
    pub message: String,
}

impl QueuedMessage {
    pub fn new(client_message_id: impl Into<ClientMessageId>, message: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            client_message_id: client_message_id.into(),
            message: message.into(),
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }
}

/// Interrupt flavour requested by the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InterruptMode {
    Soft,
    Hard,
}
