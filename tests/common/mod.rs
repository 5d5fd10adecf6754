//! Shared test helpers: controllable model, probe tools and an update log.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use turnstile::error::{Result, TurnstileError};
use turnstile::model::{AgentModel, Message, ModelDecision, Role, ToolCall};
use turnstile::run::confirmation::{ConfirmationDetail, Decision};
use turnstile::run::{DriverHandle, DriverSnapshot, RunUpdate, RunUpdatePayload, UpdateSink};
use turnstile::tools::{AgentTool, Tool, ToolContext, ToolDefinition, ToolParameters};

/// Generous bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(30);

/// A model whose decisions are fed one at a time by the test.
pub struct ChannelModel {
    decisions: Mutex<mpsc::UnboundedReceiver<Result<ModelDecision>>>,
    calls: AtomicUsize,
    prompts: std::sync::Mutex<Vec<String>>,
}

/// Test side of a [`ChannelModel`].
#[derive(Clone)]
pub struct ModelFeed {
    tx: mpsc::UnboundedSender<Result<ModelDecision>>,
}

impl ChannelModel {
    pub fn new() -> (Arc<Self>, ModelFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let model = Arc::new(Self {
            decisions: Mutex::new(rx),
            calls: AtomicUsize::new(0),
            prompts: std::sync::Mutex::new(Vec::new()),
        });
        (model, ModelFeed { tx })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Last user message seen by each call, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl ModelFeed {
    pub fn answer(&self, text: &str) {
        self.send(Ok(ModelDecision::Final { text: text.into() }));
    }

    pub fn call(&self, calls: Vec<ToolCall>) {
        self.send(Ok(ModelDecision::UseTools {
            text: None,
            reasoning: None,
            calls,
        }));
    }

    pub fn fail(&self, message: &str) {
        self.send(Err(TurnstileError::provider("channel", message)));
    }

    fn send(&self, decision: Result<ModelDecision>) {
        self.tx.send(decision).unwrap();
    }
}

#[async_trait]
impl AgentModel for ChannelModel {
    fn name(&self) -> &str {
        "channel"
    }

    async fn decide(
        &self,
        transcript: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ModelDecision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(last_user) = transcript.iter().rev().find(|m| m.role == Role::User) {
            self.prompts.lock().unwrap().push(last_user.content.clone());
        }
        let mut decisions = self.decisions.lock().await;
        match decisions.recv().await {
            Some(decision) => decision,
            None => Err(TurnstileError::provider("channel", "feed closed")),
        }
    }
}

/// Counts how many times a probe tool actually performed its action.
#[derive(Clone, Default)]
pub struct ProbeCounter(Arc<AtomicUsize>);

impl ProbeCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A tool that asks for confirmation before "running".
pub fn probe_tool(counter: ProbeCounter) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "probe",
        "Side-effecting test tool",
        ToolParameters::object()
            .string("target", "What to probe", true)
            .build(),
        move |args, ctx: ToolContext| {
            let counter = counter.clone();
            async move {
                let target = args.get_str("target")?.to_string();
                let decision = ctx
                    .request_confirmation(
                        "probe",
                        target.clone(),
                        ConfirmationDetail {
                            tool_name: "probe".into(),
                            tool_args: args.raw().clone(),
                            message: None,
                        },
                    )
                    .await;
                if let Decision::Denied { reason } = decision {
                    return Ok(format!("Probe cancelled: {reason}"));
                }
                counter.0.fetch_add(1, Ordering::SeqCst);
                Ok(format!("probed {target}"))
            }
        },
    ))
}

/// A tool that ignores cancellation and never finishes on its own.
pub fn stubborn_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "stubborn",
        "Never returns",
        ToolParameters::empty(),
        |_args, _ctx: ToolContext| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("finally".to_string())
        },
    ))
}

/// A tool whose body panics.
#[allow(unreachable_code)]
pub fn panicking_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        "explode",
        "Panics when run",
        ToolParameters::empty(),
        |_args, _ctx: ToolContext| async move {
            panic!("tool bug");
            Ok(String::new())
        },
    ))
}

pub fn probe_call(id: &str, target: &str) -> ToolCall {
    ToolCall::new(id, "probe", serde_json::json!({ "target": target }))
}

/// Collects every update a driver emits.
pub struct UpdateLog {
    rx: mpsc::UnboundedReceiver<RunUpdate>,
}

pub fn update_log() -> (UpdateSink, UpdateLog) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: UpdateSink = Arc::new(move |update| {
        let _ = tx.send(update);
    });
    (sink, UpdateLog { rx })
}

impl UpdateLog {
    /// Wait for the next update matching `predicate`, skipping others.
    pub async fn next_matching(
        &mut self,
        mut predicate: impl FnMut(&RunUpdatePayload) -> bool,
    ) -> RunUpdate {
        tokio::time::timeout(WAIT, async {
            loop {
                let update = self.rx.recv().await.expect("update sink closed");
                if predicate(&update.payload) {
                    return update;
                }
            }
        })
        .await
        .expect("timed out waiting for update")
    }

    /// Wait for the next confirmation request and return its id.
    pub async fn confirmation_id(&mut self) -> String {
        let update = self
            .next_matching(|p| matches!(p, RunUpdatePayload::ConfirmationRequested { .. }))
            .await;
        match update.payload {
            RunUpdatePayload::ConfirmationRequested { request } => request.id,
            _ => unreachable!(),
        }
    }

    /// Everything received so far, without waiting.
    pub fn drain(&mut self) -> Vec<RunUpdatePayload> {
        let mut payloads = Vec::new();
        while let Ok(update) = self.rx.try_recv() {
            payloads.push(update.payload);
        }
        payloads
    }
}

/// Wait until the driver has no active run.
pub async fn settled(handle: &DriverHandle) -> DriverSnapshot {
    wait_until(handle, |s| !s.state.is_running()).await
}

pub async fn wait_until(
    handle: &DriverHandle,
    predicate: impl FnMut(&DriverSnapshot) -> bool,
) -> DriverSnapshot {
    tokio::time::timeout(WAIT, handle.wait_for(predicate))
        .await
        .expect("timed out waiting for snapshot")
        .expect("driver closed")
}
