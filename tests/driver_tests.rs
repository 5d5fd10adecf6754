//! End-to-end driver behaviour: interrupts, confirmations, draining, watchdog.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::*;
use turnstile::config::TurnstileConfig;
use turnstile::model::{ScriptedModel, ScriptedStep, ToolCall};
use turnstile::run::{
    Dispatch, DriverEnv, DriverHandle, InterruptMode, QueuedMessage, RunDriver, RunUpdatePayload,
    StopMode, StopReason, RUN_CANCELLED, SKIPPED_CANCELLED,
};
use turnstile::tools::ToolRegistry;

fn probe_env(model: Arc<dyn turnstile::model::AgentModel>) -> (DriverEnv, ProbeCounter, UpdateLog) {
    let counter = ProbeCounter::default();
    let (sink, log) = update_log();
    let env = DriverEnv::new(model)
        .with_tools(ToolRegistry::new(vec![probe_tool(counter.clone())]))
        .with_sink(sink);
    (env, counter, log)
}

fn spawn(env: DriverEnv) -> DriverHandle {
    RunDriver::spawn("conv-1", env)
}

#[tokio::test]
async fn hard_stop_denies_pending_confirmation_and_stops() {
    let (model, feed) = ChannelModel::new();
    let (env, counter, mut log) = probe_env(model.clone());
    let handle = spawn(env);

    handle.start_run("m0", "probe the disk").await.unwrap();
    feed.call(vec![probe_call("call-1", "disk")]);

    let id = log.confirmation_id().await;
    let snapshot = wait_until(&handle, |s| {
        s.state
            .running()
            .is_some_and(|r| r.pending_confirmations.contains(&id))
    })
    .await;
    assert_eq!(snapshot.state.running().unwrap().stop_mode, StopMode::None);

    assert_eq!(handle.hard_stop().await.unwrap(), Dispatch::Stopping);

    let snapshot = settled(&handle).await;
    let stopped = snapshot.state.stopped().expect("run should be stopped");
    assert_eq!(stopped.reason, StopReason::UserStop);
    assert!(stopped.queued_messages.is_empty());
    assert!(snapshot.backlog.is_empty());

    let finished = log
        .next_matching(|p| matches!(p, RunUpdatePayload::ToolFinished { .. }))
        .await;
    assert_eq!(
        finished.payload,
        RunUpdatePayload::ToolFinished {
            call_id: "call-1".into(),
            tool_name: "probe".into(),
            output: format!("Probe cancelled: {RUN_CANCELLED}"),
            is_error: false,
        }
    );
    assert_eq!(counter.get(), 0);

    // The request is gone; a late approval changes nothing.
    assert!(!handle.resolve_confirmation(id, true, None).await.unwrap());
    assert!(handle.state().stopped().is_some());
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn hard_stop_skips_tool_calls_that_have_not_started() {
    let (model, feed) = ChannelModel::new();
    let (env, counter, mut log) = probe_env(model);
    let handle = spawn(env);

    handle.start_run("m0", "probe twice").await.unwrap();
    feed.call(vec![probe_call("call-1", "a"), probe_call("call-2", "b")]);
    log.confirmation_id().await;
    handle.hard_stop().await.unwrap();
    settled(&handle).await;

    let mut outputs = Vec::new();
    for payload in log.drain() {
        if let RunUpdatePayload::ToolFinished { call_id, output, .. } = payload {
            outputs.push((call_id, output));
        }
    }
    assert_eq!(
        outputs,
        vec![
            ("call-1".to_string(), format!("Probe cancelled: {RUN_CANCELLED}")),
            ("call-2".to_string(), SKIPPED_CANCELLED.to_string()),
        ]
    );
    assert_eq!(counter.get(), 0);
}

#[tokio::test]
async fn approved_confirmation_lets_the_run_continue() {
    let (model, feed) = ChannelModel::new();
    let (env, counter, mut log) = probe_env(model);
    let handle = spawn(env);

    handle.start_run("m0", "probe it").await.unwrap();
    feed.call(vec![probe_call("call-1", "disk")]);
    let id = log.confirmation_id().await;

    assert!(handle
        .resolve_confirmation(id.clone(), true, Some("fine".into()))
        .await
        .unwrap());
    assert!(!handle.resolve_confirmation(id.clone(), false, None).await.unwrap());

    let resolved = log
        .next_matching(|p| matches!(p, RunUpdatePayload::ConfirmationResolved { .. }))
        .await;
    assert_eq!(
        resolved.payload,
        RunUpdatePayload::ConfirmationResolved {
            id,
            approved: true,
            reason: Some("fine".into()),
        }
    );

    feed.answer("disk looks healthy");
    let snapshot = settled(&handle).await;
    assert!(snapshot.state.is_idle());
    assert_eq!(snapshot.step, 2);
    assert_eq!(counter.get(), 1);
}

#[tokio::test]
async fn soft_interrupts_drain_in_arrival_order() {
    let (model, feed) = ChannelModel::new();
    let (sink, mut log) = update_log();
    let handle = spawn(DriverEnv::new(model.clone()).with_sink(sink));

    handle.start_run("m0", "first").await.unwrap();
    let m1 = QueuedMessage::new("m1", "second");
    let m2 = QueuedMessage::new("m2", "third");
    assert_eq!(
        handle.soft_interrupt(m1.clone()).await.unwrap(),
        Dispatch::Queued { position: 1 }
    );
    assert_eq!(
        handle.soft_interrupt(m2.clone()).await.unwrap(),
        Dispatch::Queued { position: 2 }
    );
    let queued = handle.state().queued_messages().to_vec();
    assert_eq!(queued, vec![m1.clone(), m2.clone()]);

    // Finishing the step hands off to m1; m2 waits in the backlog.
    feed.answer("done with first");
    let stopped = log
        .next_matching(|p| matches!(p, RunUpdatePayload::RunStopped { .. }))
        .await;
    assert_eq!(
        stopped.payload,
        RunUpdatePayload::RunStopped {
            reason: StopReason::SoftInterrupt,
            queued: 2,
        }
    );
    let snapshot = wait_until(&handle, |s| s.state.run_id() == Some(m1.run_id)).await;
    let running = snapshot.state.running().unwrap();
    assert_eq!(running.client_message_id, "m1");
    assert_eq!(running.stop_mode, StopMode::None);
    assert_eq!(snapshot.backlog, vec![m2.clone()]);

    feed.answer("done with second");
    wait_until(&handle, |s| s.state.run_id() == Some(m2.run_id)).await;
    feed.answer("done with third");
    let snapshot = wait_until(&handle, |s| s.state.is_idle() && s.backlog.is_empty()).await;
    assert_eq!(snapshot.step, 1);

    let started: Vec<String> = log
        .drain()
        .into_iter()
        .filter_map(|p| match p {
            RunUpdatePayload::RunStarted { client_message_id } => Some(client_message_id),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["m1".to_string(), "m2".to_string()]);
    assert_eq!(model.prompts(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn soft_interrupt_without_message_keeps_running() {
    let (model, feed) = ChannelModel::new();
    let handle = spawn(DriverEnv::new(model).with_tools(ToolRegistry::default()));

    handle.start_run("m0", "work").await.unwrap();
    assert_eq!(
        handle.interrupt(InterruptMode::Soft, None).await.unwrap(),
        Dispatch::Stopping
    );
    feed.call(vec![]);
    let snapshot = settled(&handle).await;
    assert!(snapshot.state.is_idle());
}

#[tokio::test]
async fn hard_stop_discards_queued_follow_ups() {
    let (model, _feed) = ChannelModel::new();
    let (sink, mut log) = update_log();
    let handle = spawn(DriverEnv::new(model).with_sink(sink));

    handle.start_run("m0", "first").await.unwrap();
    handle
        .soft_interrupt(QueuedMessage::new("m1", "second"))
        .await
        .unwrap();
    handle.hard_stop().await.unwrap();

    // Hard owns the rest of the run.
    assert_eq!(
        handle
            .soft_interrupt(QueuedMessage::new("m2", "third"))
            .await
            .unwrap(),
        Dispatch::Ignored
    );
    assert_eq!(handle.hard_stop().await.unwrap(), Dispatch::Ignored);

    let snapshot = settled(&handle).await;
    assert_eq!(snapshot.state.stopped().unwrap().reason, StopReason::UserStop);
    assert!(snapshot.backlog.is_empty());

    let payloads = log.drain();
    assert!(payloads.contains(&RunUpdatePayload::QueueDiscarded { count: 1 }));
    assert!(payloads.contains(&RunUpdatePayload::RunStopped {
        reason: StopReason::UserStop,
        queued: 0,
    }));
    assert!(!payloads
        .iter()
        .any(|p| matches!(p, RunUpdatePayload::RunStarted { client_message_id } if client_message_id != "m0")));
}

#[tokio::test]
async fn stopped_conversation_is_restartable() {
    let (model, feed) = ChannelModel::new();
    let handle = spawn(DriverEnv::new(model));

    handle.start_run("m0", "first").await.unwrap();
    handle.hard_stop().await.unwrap();
    assert!(settled(&handle).await.state.stopped().is_some());

    let dispatch = handle.start_run("m1", "again").await.unwrap();
    assert!(matches!(dispatch, Dispatch::Started(_)));
    feed.answer("ok");
    assert!(settled(&handle).await.state.is_idle());
}

#[tokio::test]
async fn model_error_stops_with_error_and_stays_restartable() {
    let model = Arc::new(ScriptedModel::new([ScriptedStep::fail("upstream 503")]));
    let (sink, mut log) = update_log();
    let handle = spawn(DriverEnv::new(model).with_sink(sink));

    handle.start_run("m0", "hello").await.unwrap();
    let snapshot = settled(&handle).await;
    let stopped = snapshot.state.stopped().unwrap();
    assert_eq!(stopped.reason, StopReason::Error);
    assert!(stopped.detail.as_deref().unwrap().contains("upstream 503"));
    assert!(snapshot.last_error.unwrap().contains("upstream 503"));
    assert!(log
        .drain()
        .iter()
        .any(|p| matches!(p, RunUpdatePayload::RunError { error } if error.contains("upstream 503"))));

    // The script is exhausted, so the next run answers "Done.".
    handle.start_run("m1", "try again").await.unwrap();
    let snapshot = settled(&handle).await;
    assert!(snapshot.state.is_idle());
    assert!(snapshot.last_error.is_none());
}

#[tokio::test]
async fn model_error_still_drains_the_queue() {
    let (model, feed) = ChannelModel::new();
    let handle = spawn(DriverEnv::new(model));

    handle.start_run("m0", "first").await.unwrap();
    let m1 = QueuedMessage::new("m1", "second");
    handle.soft_interrupt(m1.clone()).await.unwrap();
    feed.fail("connection reset");

    wait_until(&handle, |s| s.state.run_id() == Some(m1.run_id)).await;
    feed.answer("recovered");
    let snapshot = settled(&handle).await;
    assert!(snapshot.state.is_idle());
    assert!(snapshot.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn watchdog_settles_a_step_that_ignores_cancellation() {
    let model = Arc::new(ScriptedModel::new([ScriptedStep::tool(
        "stubborn",
        serde_json::json!({}),
    )]));
    let (sink, mut log) = update_log();
    let config = TurnstileConfig {
        hard_stop_grace_ms: 5_000,
        ..Default::default()
    };
    let env = DriverEnv::new(model)
        .with_tools(ToolRegistry::new(vec![stubborn_tool()]))
        .with_config(config)
        .with_sink(sink);
    let handle = spawn(env);

    handle.start_run("m0", "hang").await.unwrap();
    log.next_matching(|p| matches!(p, RunUpdatePayload::ToolStarted { .. }))
        .await;

    let stopped_at = tokio::time::Instant::now();
    handle.hard_stop().await.unwrap();
    let snapshot = settled(&handle).await;

    assert!(stopped_at.elapsed() >= Duration::from_secs(5));
    assert_eq!(snapshot.state.stopped().unwrap().reason, StopReason::UserStop);
    assert!(!log
        .drain()
        .iter()
        .any(|p| matches!(p, RunUpdatePayload::ToolFinished { .. })));
}

#[tokio::test]
async fn interrupts_on_idle_conversation_are_ignored() {
    let handle = spawn(DriverEnv::new(Arc::new(ScriptedModel::default())));
    assert_eq!(handle.hard_stop().await.unwrap(), Dispatch::Ignored);
    assert_eq!(
        handle
            .soft_interrupt(QueuedMessage::new("m1", "hi"))
            .await
            .unwrap(),
        Dispatch::Ignored
    );
    assert!(handle.state().is_idle());
}

#[tokio::test]
async fn step_timeout_fails_the_run() {
    let (model, _feed) = ChannelModel::new();
    let config = TurnstileConfig {
        step_timeout_ms: 50,
        ..Default::default()
    };
    let handle = spawn(DriverEnv::new(model).with_config(config));

    handle.start_run("m0", "slow").await.unwrap();
    let snapshot = settled(&handle).await;
    assert_eq!(snapshot.state.stopped().unwrap().reason, StopReason::Error);
    assert_eq!(snapshot.last_error.as_deref(), Some("Timeout after 50ms"));
}

#[tokio::test]
async fn panicking_tool_becomes_an_error_result() {
    let (model, feed) = ChannelModel::new();
    let (sink, mut log) = update_log();
    let env = DriverEnv::new(model.clone())
        .with_tools(ToolRegistry::new(vec![panicking_tool()]))
        .with_sink(sink);
    let handle = spawn(env);

    handle.start_run("m0", "blow up").await.unwrap();
    feed.call(vec![ToolCall::new("call-1", "explode", serde_json::json!({}))]);

    let finished = log
        .next_matching(|p| matches!(p, RunUpdatePayload::ToolFinished { .. }))
        .await;
    assert_eq!(
        finished.payload,
        RunUpdatePayload::ToolFinished {
            call_id: "call-1".into(),
            tool_name: "explode".into(),
            output: "Error: tool 'explode' panicked".into(),
            is_error: true,
        }
    );

    feed.answer("recovered");
    let snapshot = settled(&handle).await;
    assert!(snapshot.state.is_idle());
    assert!(snapshot.last_error.is_none());
    assert_eq!(model.calls(), 2);
}

#[tokio::test]
async fn dropping_every_handle_ends_a_driver_waiting_on_confirmation() {
    let (model, feed) = ChannelModel::new();
    let (env, counter, mut log) = probe_env(model);
    let handle = spawn(env);

    handle.start_run("m0", "probe the disk").await.unwrap();
    feed.call(vec![probe_call("call-1", "disk")]);
    let id = log.confirmation_id().await;
    wait_until(&handle, |s| {
        s.state
            .running()
            .is_some_and(|r| r.pending_confirmations.contains(&id))
    })
    .await;

    let mut snapshots = handle.watch();
    drop(handle);
    tokio::time::timeout(WAIT, async {
        while snapshots.changed().await.is_ok() {}
    })
    .await
    .expect("driver outlived its handles");
    assert_eq!(counter.get(), 0);
}
