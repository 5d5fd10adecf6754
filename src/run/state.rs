//! The per-conversation run state.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;

use super::types::{ClientMessageId, ConfirmationId, QueuedMessage, RunId, StopMode, StopReason};

/// Run lifecycle state for one conversation.
///
/// Values are only produced by [`transition_run`](super::machine::transition_run)
/// and are shared behind an `Arc`, so a no-op transition hands back the very
/// same allocation.
#[derive(Debug, Clone, Default)]
pub enum RunState {
    /// No run in progress.
    #[default]
    Idle,
    Running(RunningState),
    Stopped(StoppedState),
}

/// Payload of [`RunState::Running`].
#[derive(Debug, Clone)]
pub struct RunningState {
    pub run_id: RunId,
    pub client_message_id: ClientMessageId,
    pub stop_mode: StopMode,
    /// Non-empty only while `stop_mode` is `Soft`.
    pub queued_messages: Vec<QueuedMessage>,
    pub pending_confirmations: BTreeSet<ConfirmationId>,
    /// Fired by the driver on hard stop; observed by in-flight work.
    pub cancellation: CancellationToken,
}

/// Payload of [`RunState::Stopped`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedState {
    pub run_id: RunId,
    pub reason: StopReason,
    pub queued_messages: Vec<QueuedMessage>,
    /// Error text for `StopReason::Error`.
    pub detail: Option<String>,
}

impl RunState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Self::Idle => None,
            Self::Running(running) => Some(running.run_id),
            Self::Stopped(stopped) => Some(stopped.run_id),
        }
    }

    pub fn running(&self) -> Option<&RunningState> {
        match self {
            Self::Running(running) => Some(running),
            _ => None,
        }
    }

    pub fn stopped(&self) -> Option<&StoppedState> {
        match self {
            Self::Stopped(stopped) => Some(stopped),
            _ => None,
        }
    }

    /// Queued follow-ups, whichever variant holds them.
    pub fn queued_messages(&self) -> &[QueuedMessage] {
        match self {
            Self::Idle => &[],
            Self::Running(running) => &running.queued_messages,
            Self::Stopped(stopped) => &stopped.queued_messages,
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running(_) => "running",
            Self::Stopped(_) => "stopped",
        }
    }
}
