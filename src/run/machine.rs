//! Pure run state transitions.
//!
//! [`transition_run`] never performs I/O and never fires the cancellation
//! token; the driver owns every side effect. Events that do not apply to the
//! current state return the input `Arc` unchanged, so callers detect a no-op
//! with [`Arc::ptr_eq`] (see [`is_noop`]).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::state::{RunState, RunningState, StoppedState};
use super::types::{ClientMessageId, ConfirmationId, QueuedMessage, RunId, StopMode, StopReason};

/// Input to the run state machine.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Begin a run. The driver mints the token the new state will own.
    StartRun {
        run_id: RunId,
        client_message_id: ClientMessageId,
        cancellation: CancellationToken,
    },
    /// Let the current step finish, then stop and hand off to the queue.
    /// `None` only raises the stop mode.
    SoftInterrupt { message: Option<QueuedMessage> },
    /// Stop as soon as possible and discard every queued follow-up.
    HardStop,
    StepCompleted,
    RunComplete,
    RunError { error: String },
    /// Track a confirmation waiting on the user.
    ConfirmationRequested { id: ConfirmationId },
    /// Forget a confirmation once it resolved or was abandoned.
    ConfirmationSettled { id: ConfirmationId },
    Reset,
}

impl RunEvent {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::StartRun { .. } => "start_run",
            Self::SoftInterrupt { .. } => "soft_interrupt",
            Self::HardStop => "hard_stop",
            Self::StepCompleted => "step_completed",
            Self::RunComplete => "run_complete",
            Self::RunError { .. } => "run_error",
            Self::ConfirmationRequested { .. } => "confirmation_requested",
            Self::ConfirmationSettled { .. } => "confirmation_settled",
            Self::Reset => "reset",
        }
    }
}

/// Apply `event` to `state`.
pub fn transition_run(state: &Arc<RunState>, event: RunEvent) -> Arc<RunState> {
    match (state.as_ref(), event) {
        (RunState::Idle, RunEvent::StartRun {
            run_id,
            client_message_id,
            cancellation,
        }) => Arc::new(RunState::Running(RunningState {
            run_id,
            client_message_id,
            stop_mode: StopMode::None,
            queued_messages: Vec::new(),
            pending_confirmations: Default::default(),
            cancellation,
        })),

        (RunState::Running(running), RunEvent::SoftInterrupt { message }) => {
            soft_interrupt(state, running, message)
        }

        (RunState::Running(running), RunEvent::HardStop) => {
            if running.stop_mode == StopMode::Hard && running.queued_messages.is_empty() {
                return Arc::clone(state);
            }
            Arc::new(RunState::Running(RunningState {
                stop_mode: StopMode::Hard,
                queued_messages: Vec::new(),
                ..running.clone()
            }))
        }

        (RunState::Running(running), RunEvent::StepCompleted) => match running.stop_mode {
            StopMode::Hard => Arc::new(RunState::Stopped(StoppedState {
                run_id: running.run_id,
                reason: StopReason::UserStop,
                queued_messages: Vec::new(),
                detail: None,
            })),
            StopMode::Soft if !running.queued_messages.is_empty() => {
                Arc::new(RunState::Stopped(StoppedState {
                    run_id: running.run_id,
                    reason: StopReason::SoftInterrupt,
                    queued_messages: running.queued_messages.clone(),
                    detail: None,
                }))
            }
            // Stopping is driven by queued work, not the mode flag alone.
            StopMode::Soft | StopMode::None => Arc::clone(state),
        },

        (RunState::Running(_), RunEvent::RunComplete) => Arc::new(RunState::Idle),

        (RunState::Running(running), RunEvent::RunError { error }) => {
            Arc::new(RunState::Stopped(StoppedState {
                run_id: running.run_id,
                reason: StopReason::Error,
                queued_messages: running.queued_messages.clone(),
                detail: Some(error),
            }))
        }

        (RunState::Running(running), RunEvent::ConfirmationRequested { id }) => {
            if running.pending_confirmations.contains(&id) {
                return Arc::clone(state);
            }
            let mut next = running.clone();
            next.pending_confirmations.insert(id);
            Arc::new(RunState::Running(next))
        }

        (RunState::Running(running), RunEvent::ConfirmationSettled { id }) => {
            if !running.pending_confirmations.contains(&id) {
                return Arc::clone(state);
            }
            let mut next = running.clone();
            next.pending_confirmations.remove(&id);
            Arc::new(RunState::Running(next))
        }

        (RunState::Idle, RunEvent::Reset) => Arc::clone(state),
        (_, RunEvent::Reset) => Arc::new(RunState::Idle),

        _ => Arc::clone(state),
    }
}

fn soft_interrupt(
    state: &Arc<RunState>,
    running: &RunningState,
    message: Option<QueuedMessage>,
) -> Arc<RunState> {
    // Hard stop owns precedence for the rest of the run.
    if running.stop_mode == StopMode::Hard {
        return Arc::clone(state);
    }
    if message.is_none() && running.stop_mode == StopMode::Soft {
        return Arc::clone(state);
    }
    let mut next = running.clone();
    next.stop_mode = StopMode::Soft;
    next.queued_messages.extend(message);
    Arc::new(RunState::Running(next))
}

/// Whether `after` is the unchanged result of transitioning `before`.
pub fn is_noop(before: &Arc<RunState>, after: &Arc<RunState>) -> bool {
    Arc::ptr_eq(before, after)
}
