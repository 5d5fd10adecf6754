//! Properties of the pure run state machine.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use turnstile::run::{
    is_noop, transition_run, QueuedMessage, RunEvent, RunState, StopMode, StopReason,
};

fn idle() -> Arc<RunState> {
    Arc::new(RunState::Idle)
}

fn start(state: &Arc<RunState>, run_id: Uuid) -> Arc<RunState> {
    transition_run(
        state,
        RunEvent::StartRun {
            run_id,
            client_message_id: "c0".into(),
            cancellation: CancellationToken::new(),
        },
    )
}

fn running() -> Arc<RunState> {
    start(&idle(), Uuid::new_v4())
}

fn soft(state: &Arc<RunState>, message: &QueuedMessage) -> Arc<RunState> {
    transition_run(
        state,
        RunEvent::SoftInterrupt {
            message: Some(message.clone()),
        },
    )
}

fn stopped() -> Arc<RunState> {
    transition_run(
        &running(),
        RunEvent::RunError {
            error: "boom".into(),
        },
    )
}

#[test]
fn reset_always_reaches_idle_and_second_reset_is_noop() {
    for state in [idle(), running(), stopped()] {
        let reset = transition_run(&state, RunEvent::Reset);
        assert!(reset.is_idle());
        let again = transition_run(&reset, RunEvent::Reset);
        assert!(is_noop(&reset, &again));
    }
}

#[test]
fn start_run_from_idle_is_fresh() {
    let run_id = Uuid::new_v4();
    let state = start(&idle(), run_id);
    let running = state.running().unwrap();
    assert_eq!(running.run_id, run_id);
    assert_eq!(running.client_message_id, "c0");
    assert_eq!(running.stop_mode, StopMode::None);
    assert!(running.queued_messages.is_empty());
    assert!(running.pending_confirmations.is_empty());
}

#[test]
fn start_run_while_running_keeps_the_original_run() {
    let state = running();
    let original = state.run_id();
    let next = start(&state, Uuid::new_v4());
    assert!(is_noop(&state, &next));
    assert_eq!(next.run_id(), original);
}

#[test]
fn start_run_from_stopped_is_noop() {
    let state = stopped();
    let next = start(&state, Uuid::new_v4());
    assert!(is_noop(&state, &next));
}

#[test]
fn soft_interrupts_queue_in_fifo_order() {
    let (m1, m2, m3) = (
        QueuedMessage::new("m1", "one"),
        QueuedMessage::new("m2", "two"),
        QueuedMessage::new("m3", "three"),
    );
    let state = soft(&soft(&soft(&running(), &m1), &m2), &m3);
    let running = state.running().unwrap();
    assert_eq!(running.stop_mode, StopMode::Soft);
    assert_eq!(running.queued_messages, vec![m1, m2, m3]);
}

#[test]
fn soft_interrupt_outside_running_is_noop() {
    let message = QueuedMessage::new("m1", "one");
    for state in [idle(), stopped()] {
        let next = soft(&state, &message);
        assert!(is_noop(&state, &next));
    }
}

#[test]
fn hard_stop_clears_the_queue() {
    let state = soft(&soft(&running(), &QueuedMessage::new("m1", "a")), &QueuedMessage::new("m2", "b"));
    let hard = transition_run(&state, RunEvent::HardStop);
    let running = hard.running().unwrap();
    assert_eq!(running.stop_mode, StopMode::Hard);
    assert!(running.queued_messages.is_empty());
}

#[test]
fn hard_stop_outside_running_is_noop() {
    for state in [idle(), stopped()] {
        let next = transition_run(&state, RunEvent::HardStop);
        assert!(is_noop(&state, &next));
    }
}

#[test]
fn hard_stop_is_sticky() {
    let hard = transition_run(&running(), RunEvent::HardStop);
    let next = soft(&hard, &QueuedMessage::new("m1", "late"));
    assert!(is_noop(&hard, &next));
    assert!(next.running().unwrap().queued_messages.is_empty());
}

#[test]
fn step_completed_with_soft_queue_stops() {
    let m = QueuedMessage::new("m1", "next");
    let state = soft(&running(), &m);
    let run_id = state.run_id().unwrap();
    let next = transition_run(&state, RunEvent::StepCompleted);
    let stopped = next.stopped().unwrap();
    assert_eq!(stopped.run_id, run_id);
    assert_eq!(stopped.reason, StopReason::SoftInterrupt);
    assert_eq!(stopped.queued_messages, vec![m]);
}

#[test]
fn step_completed_with_empty_soft_mode_keeps_running() {
    let state = transition_run(&running(), RunEvent::SoftInterrupt { message: None });
    let next = transition_run(&state, RunEvent::StepCompleted);
    assert!(is_noop(&state, &next));
}

#[test]
fn step_completed_after_hard_stop_is_a_user_stop() {
    let state = transition_run(&soft(&running(), &QueuedMessage::new("m1", "x")), RunEvent::HardStop);
    let next = transition_run(&state, RunEvent::StepCompleted);
    let stopped = next.stopped().unwrap();
    assert_eq!(stopped.reason, StopReason::UserStop);
    assert!(stopped.queued_messages.is_empty());
}

#[test]
fn step_completed_without_stop_returns_same_reference() {
    let state = running();
    let next = transition_run(&state, RunEvent::StepCompleted);
    assert!(Arc::ptr_eq(&state, &next));
}

#[test]
fn step_completed_outside_running_is_noop() {
    for state in [idle(), stopped()] {
        let next = transition_run(&state, RunEvent::StepCompleted);
        assert!(is_noop(&state, &next));
    }
}

#[test]
fn run_complete_only_applies_to_running() {
    assert!(transition_run(&running(), RunEvent::RunComplete).is_idle());
    for state in [idle(), stopped()] {
        let next = transition_run(&state, RunEvent::RunComplete);
        assert!(is_noop(&state, &next));
    }
}

#[test]
fn run_error_stops_with_error() {
    let state = running();
    let next = transition_run(
        &state,
        RunEvent::RunError {
            error: "provider unreachable".into(),
        },
    );
    let stopped = next.stopped().unwrap();
    assert_eq!(stopped.reason, StopReason::Error);
    assert_eq!(stopped.run_id, state.run_id().unwrap());

    let idle = idle();
    let unchanged = transition_run(&idle, RunEvent::RunError { error: "x".into() });
    assert!(is_noop(&idle, &unchanged));
}

#[test]
fn soft_then_step_completed_drains_from_first_message() {
    let (m1, m2) = (QueuedMessage::new("m1", "one"), QueuedMessage::new("m2", "two"));
    let state = soft(&soft(&running(), &m1), &m2);
    let stopped = transition_run(&state, RunEvent::StepCompleted);
    assert_eq!(
        stopped.stopped().unwrap().queued_messages,
        vec![m1.clone(), m2.clone()]
    );

    // What the driver does next: reset, then start from the head.
    let idle = transition_run(&stopped, RunEvent::Reset);
    let next = start(&idle, m1.run_id);
    assert_eq!(next.run_id(), Some(m1.run_id));
    assert!(next.queued_messages().is_empty());
}

#[test]
fn transitions_never_fire_the_token() {
    let token = CancellationToken::new();
    let state = transition_run(
        &idle(),
        RunEvent::StartRun {
            run_id: Uuid::new_v4(),
            client_message_id: "c0".into(),
            cancellation: token.clone(),
        },
    );
    let hard = transition_run(&state, RunEvent::HardStop);
    let _ = transition_run(&hard, RunEvent::StepCompleted);
    assert!(!token.is_cancelled());
}
