//! Per-conversation run driver.
//!
//! A [`RunDriver`] is an actor: one tokio task owns the conversation's
//! [`RunState`], transcript and follow-up backlog, and processes commands
//! strictly one at a time from an unbounded inbox. User input (through a
//! [`DriverHandle`]), step completions, confirmation lifecycle notices and
//! watchdog timers all arrive through that inbox, which is what serializes
//! concurrent sources without locks around the state.
//!
//! Steps run in their own tasks so a slow model call or a confirmation
//! waiting on the user never blocks the inbox; a hard stop can always get
//! through and fire the run's cancellation token.

mod step;


pub use step::SKIPPED_CANCELLED;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};
use crate::model::{AgentModel, Message};
use crate::tools::ToolRegistry;

use super::confirmation::{ConfirmationGate, ConfirmationNotice, ConfirmationObserver, Decision};
use super::events::{RunUpdatePayload, UpdateEmitter, UpdateSink};
use super::machine::{is_noop, transition_run, RunEvent};
use super::state::RunState;
use super::types::{
    ClientMessageId, ConfirmationId, ConversationId, InterruptMode, QueuedMessage, RunId,
    StopMode, StopReason,
};
use step::{StepContext, StepOutcome};

/// Everything a driver needs besides its conversation id.
#[derive(Clone)]
pub struct DriverEnv {
    pub model: Arc<dyn AgentModel>,
    pub tools: ToolRegistry,
    pub config: TurnstileConfig,
    pub sink: Option<UpdateSink>,
    /// Prepended to the transcript before the first user message.
    pub system_prompt: Option<String>,
}

impl DriverEnv {
    pub fn new(model: Arc<dyn AgentModel>) -> Self {
        Self {
            model,
            tools: ToolRegistry::default(),
            config: TurnstileConfig::default(),
            sink: None,
            system_prompt: None,
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_config(mut self, config: TurnstileConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sink(mut self, sink: UpdateSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// What the driver did with a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A new run started.
    Started(RunId),
    /// The message was queued behind the active run (1-based position).
    Queued { position: usize },
    /// The active run was asked to stop. A soft stop with nothing queued
    /// only marks the run; it keeps stepping.
    Stopping,
    /// The conversation was reset to idle.
    Reset,
    /// Nothing applied in the current state.
    Ignored,
}

/// Point-in-time view of a conversation's driver.
#[derive(Debug, Clone)]
pub struct DriverSnapshot {
    pub state: Arc<RunState>,
    /// Follow-ups already handed off by a settled run, waiting their turn.
    pub backlog: Vec<QueuedMessage>,
    /// Steps taken by the current (or last) run.
    pub step: usize,
    pub transcript_len: usize,
    pub last_error: Option<String>,
}

impl DriverSnapshot {
    fn initial() -> Self {
        Self {
            state: Arc::new(RunState::Idle),
            backlog: Vec::new(),
            step: 0,
            transcript_len: 0,
            last_error: None,
        }
    }
}

enum DriverCommand {
    StartRun {
        run_id: RunId,
        client_message_id: ClientMessageId,
        message: String,
        reply: oneshot::Sender<Dispatch>,
    },
    Submit {
        message: QueuedMessage,
        reply: oneshot::Sender<Dispatch>,
    },
    Interrupt {
        mode: InterruptMode,
        message: Option<QueuedMessage>,
        reply: oneshot::Sender<Dispatch>,
    },
    Reset {
        reply: oneshot::Sender<Dispatch>,
    },
    ResolveConfirmation {
        id: ConfirmationId,
        decision: Decision,
        reply: oneshot::Sender<bool>,
    },
    StepFinished {
        run_id: RunId,
        step: usize,
        outcome: StepOutcome,
    },
    Confirmation(ConfirmationNotice),
    WatchdogFired {
        run_id: RunId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Client side of a conversation's driver. Cheap to clone.
#[derive(Clone)]
pub struct DriverHandle {
    conversation_id: ConversationId,
    tx: mpsc::UnboundedSender<DriverCommand>,
    snapshot_rx: watch::Receiver<DriverSnapshot>,
}

impl DriverHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Start a run for `message` if none is active.
    pub async fn start_run(
        &self,
        client_message_id: impl Into<ClientMessageId>,
        message: impl Into<String>,
    ) -> Result<Dispatch> {
        self.start_run_with_id(Uuid::new_v4(), client_message_id, message)
            .await
    }

    /// Like [`start_run`](Self::start_run) with a caller-chosen run id.
    pub async fn start_run_with_id(
        &self,
        run_id: RunId,
        client_message_id: impl Into<ClientMessageId>,
        message: impl Into<String>,
    ) -> Result<Dispatch> {
        let client_message_id = client_message_id.into();
        let message = message.into();
        self.request(|reply| DriverCommand::StartRun {
            run_id,
            client_message_id,
            message,
            reply,
        })
        .await
    }

    /// Start a run, or queue the message behind the active one.
    pub async fn submit(&self, message: QueuedMessage) -> Result<Dispatch> {
        self.request(|reply| DriverCommand::Submit { message, reply })
            .await
    }

    pub async fn interrupt(
        &self,
        mode: InterruptMode,
        message: Option<QueuedMessage>,
    ) -> Result<Dispatch> {
        self.request(|reply| DriverCommand::Interrupt {
            mode,
            message,
            reply,
        })
        .await
    }

    /// Queue `message` and stop once the current step finishes.
    pub async fn soft_interrupt(&self, message: QueuedMessage) -> Result<Dispatch> {
        self.interrupt(InterruptMode::Soft, Some(message)).await
    }

    pub async fn hard_stop(&self) -> Result<Dispatch> {
        self.interrupt(InterruptMode::Hard, None).await
    }

    pub async fn reset(&self) -> Result<Dispatch> {
        self.request(|reply| DriverCommand::Reset { reply }).await
    }

    /// Deliver a user decision. `false` means the id was unknown or already settled.
    pub async fn resolve_confirmation(
        &self,
        id: impl Into<ConfirmationId>,
        approved: bool,
        reason: Option<String>,
    ) -> Result<bool> {
        let id = id.into();
        let decision = Decision::from_parts(approved, reason);
        self.request(|reply| DriverCommand::ResolveConfirmation {
            id,
            decision,
            reply,
        })
        .await
    }

    /// Stop the driver task, cancelling any active run.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| DriverCommand::Shutdown { reply }).await
    }

    pub fn snapshot(&self) -> DriverSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn state(&self) -> Arc<RunState> {
        self.snapshot_rx.borrow().state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.snapshot_rx.borrow().state.is_running()
    }

    /// Subscribe to snapshot changes.
    pub fn watch(&self) -> watch::Receiver<DriverSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&DriverSnapshot) -> bool,
    ) -> Result<DriverSnapshot> {
        let mut rx = self.snapshot_rx.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| self.closed())?;
        Ok(snapshot.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> DriverCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(command(reply)).map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    fn closed(&self) -> TurnstileError {
        TurnstileError::ConversationClosed(self.conversation_id.clone())
    }
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("conversation_id", &self.conversation_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The actor owning one conversation's run state.
pub struct RunDriver {
    conversation_id: ConversationId,
    env: DriverEnv,
    state: Arc<RunState>,
    backlog: VecDeque<QueuedMessage>,
    transcript: Vec<Message>,
    step: usize,
    step_task: Option<JoinHandle<()>>,
    last_error: Option<String>,
    gate: Arc<ConfirmationGate>,
    emitter: Arc<UpdateEmitter>,
    inbox: mpsc::UnboundedReceiver<DriverCommand>,
    self_tx: mpsc::WeakUnboundedSender<DriverCommand>,
    snapshot_tx: watch::Sender<DriverSnapshot>,
}

impl RunDriver {
    /// Spawn the driver task and return its handle.
    ///
    /// The task ends on [`DriverHandle::shutdown`] or once every handle is dropped.
    pub fn spawn(conversation_id: impl Into<ConversationId>, env: DriverEnv) -> DriverHandle {
        let (driver, handle) = Self::new(conversation_id, env);
        tokio::spawn(driver.run());
        handle
    }

    fn new(conversation_id: impl Into<ConversationId>, env: DriverEnv) -> (Self, DriverHandle) {
        let conversation_id = conversation_id.into();
        let (tx, inbox) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(DriverSnapshot::initial());
        let emitter = Arc::new(UpdateEmitter::new(conversation_id.clone(), env.sink.clone()));

        let driver = Self {
            conversation_id: conversation_id.clone(),
            env,
            state: Arc::new(RunState::Idle),
            backlog: VecDeque::new(),
            transcript: Vec::new(),
            step: 0,
            step_task: None,
            last_error: None,
            gate: Arc::new(ConfirmationGate::new()),
            emitter,
            inbox,
            self_tx: tx.downgrade(),
            snapshot_tx,
        };
        let handle = DriverHandle {
            conversation_id,
            tx,
            snapshot_rx,
        };
        (driver, handle)
    }

    async fn run(mut self) {
        tracing::debug!(conversation_id = %self.conversation_id, "driver started");
        while let Some(command) = self.inbox.recv().await {
            let keep_going = self.handle(command);
            self.publish();
            if !keep_going {
                break;
            }
        }
        self.abandon_active_run();
        self.publish();
        tracing::debug!(conversation_id = %self.conversation_id, "driver stopped");
    }

    fn handle(&mut self, command: DriverCommand) -> bool {
        match command {
            DriverCommand::StartRun {
                run_id,
                client_message_id,
                message,
                reply,
            } => {
                let dispatch = self.start_run(run_id, client_message_id, message);
                self.reply(reply, dispatch);
            }
            DriverCommand::Submit { message, reply } => {
                let dispatch = if self.state.is_running() {
                    self.soft_interrupt(Some(message))
                } else {
                    self.start_run(message.run_id, message.client_message_id, message.message)
                };
                self.reply(reply, dispatch);
            }
            DriverCommand::Interrupt {
                mode,
                message,
                reply,
            } => {
                let dispatch = match mode {
                    InterruptMode::Soft => self.soft_interrupt(message),
                    InterruptMode::Hard => self.hard_stop(),
                };
                self.reply(reply, dispatch);
            }
            DriverCommand::Reset { reply } => {
                let dispatch = self.reset();
                self.reply(reply, dispatch);
            }
            DriverCommand::ResolveConfirmation {
                id,
                decision,
                reply,
            } => {
                let resolved = self.gate.resolve(&id, decision);
                self.reply(reply, resolved);
            }
            DriverCommand::StepFinished {
                run_id,
                step,
                outcome,
            } => self.step_finished(run_id, step, outcome),
            DriverCommand::Confirmation(notice) => self.confirmation_notice(notice),
            DriverCommand::WatchdogFired { run_id } => self.watchdog_fired(run_id),
            DriverCommand::Shutdown { reply } => {
                self.abandon_active_run();
                self.inbox.close();
                self.reply(reply, ());
                return false;
            }
        }
        true
    }

    /// Publish first so a caller woken by the reply sees the new snapshot.
    fn reply<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish();
        let _ = reply.send(value);
    }

    /// Apply an event; returns whether the state changed.
    fn apply(&mut self, event: RunEvent) -> bool {
        let label = event.label();
        let next = transition_run(&self.state, event);
        if is_noop(&self.state, &next) {
            tracing::debug!(
                conversation_id = %self.conversation_id,
                event = label,
                state = self.state.label(),
                "run event ignored"
            );
            return false;
        }
        tracing::debug!(
            conversation_id = %self.conversation_id,
            event = label,
            from = self.state.label(),
            to = next.label(),
            "run transition"
        );
        self.state = next;
        true
    }

    fn emit(&self, payload: RunUpdatePayload) {
        self.emitter.emit(self.state.run_id(), payload);
    }

    fn start_run(
        &mut self,
        run_id: RunId,
        client_message_id: ClientMessageId,
        message: String,
    ) -> Dispatch {
        if self.state.is_running() {
            return Dispatch::Ignored;
        }
        if matches!(*self.state, RunState::Stopped(_)) {
            self.apply(RunEvent::Reset);
        }
        self.apply(RunEvent::StartRun {
            run_id,
            client_message_id: client_message_id.clone(),
            cancellation: CancellationToken::new(),
        });

        if self.transcript.is_empty() {
            if let Some(prompt) = &self.env.system_prompt {
                self.transcript.push(Message::system(prompt.clone()));
            }
        }
        self.transcript.push(Message::user(message));
        self.step = 0;
        self.last_error = None;

        tracing::info!(
            conversation_id = %self.conversation_id,
            run_id = %run_id,
            client_message_id = %client_message_id,
            "run started"
        );
        self.emit(RunUpdatePayload::RunStarted { client_message_id });
        self.spawn_step();
        Dispatch::Started(run_id)
    }

    fn soft_interrupt(&mut self, message: Option<QueuedMessage>) -> Dispatch {
        let has_message = message.is_some();
        if !self.apply(RunEvent::SoftInterrupt { message }) {
            return Dispatch::Ignored;
        }
        self.emit(RunUpdatePayload::StopRequested {
            mode: InterruptMode::Soft,
        });
        if has_message {
            Dispatch::Queued {
                position: self.state.queued_messages().len() + self.backlog.len(),
            }
        } else {
            Dispatch::Stopping
        }
    }

    fn hard_stop(&mut self) -> Dispatch {
        let Some(running) = self.state.running() else {
            return Dispatch::Ignored;
        };
        let run_id = running.run_id;
        let cancellation = running.cancellation.clone();
        let discarded = running.queued_messages.len() + self.backlog.len();
        if !self.apply(RunEvent::HardStop) {
            return Dispatch::Ignored;
        }

        cancellation.cancel();
        self.backlog.clear();
        tracing::info!(
            conversation_id = %self.conversation_id,
            run_id = %run_id,
            discarded,
            "hard stop requested"
        );
        self.emit(RunUpdatePayload::StopRequested {
            mode: InterruptMode::Hard,
        });
        if discarded > 0 {
            self.emit(RunUpdatePayload::QueueDiscarded { count: discarded });
        }
        self.arm_watchdog(run_id);
        Dispatch::Stopping
    }

    fn reset(&mut self) -> Dispatch {
        let discarded = self.state.queued_messages().len() + self.backlog.len();
        self.abandon_active_run();
        if !self.apply(RunEvent::Reset) && discarded == 0 {
            return Dispatch::Ignored;
        }
        self.emitter.emit(None, RunUpdatePayload::Reset);
        if discarded > 0 {
            self.emitter
                .emit(None, RunUpdatePayload::QueueDiscarded { count: discarded });
        }
        Dispatch::Reset
    }

    /// Cancel in-flight work without touching the state value.
    fn abandon_active_run(&mut self) {
        if let Some(running) = self.state.running() {
            running.cancellation.cancel();
            self.gate.cancel_run(running.run_id);
        }
        if let Some(task) = self.step_task.take() {
            task.abort();
        }
        self.backlog.clear();
    }

    fn step_finished(&mut self, run_id: RunId, step: usize, outcome: StepOutcome) {
        let current = self.state.running().map(|running| running.run_id);
        if current != Some(run_id) || step != self.step {
            tracing::debug!(
                conversation_id = %self.conversation_id,
                run_id = %run_id,
                step,
                "ignoring stale step result"
            );
            return;
        }
        self.step_task = None;

        match outcome {
            StepOutcome::Continue { messages } | StepOutcome::Cancelled { messages } => {
                self.transcript.extend(messages);
                self.complete_step(false);
            }
            StepOutcome::Final { messages } => {
                self.transcript.extend(messages);
                self.complete_step(true);
            }
            StepOutcome::Failed { error } => {
                let hard_stopped = self
                    .state
                    .running()
                    .is_some_and(|running| running.stop_mode == StopMode::Hard);
                if hard_stopped {
                    // The user's stop is the reason this run ends.
                    tracing::debug!(
                        conversation_id = %self.conversation_id,
                        run_id = %run_id,
                        error = %error,
                        "step failed after hard stop"
                    );
                    self.complete_step(false);
                } else {
                    self.fail_run(error);
                }
            }
        }
    }

    fn complete_step(&mut self, is_final: bool) {
        self.apply(RunEvent::StepCompleted);

        let Some(running) = self.state.running() else {
            self.settle();
            return;
        };

        if is_final {
            let run_id = running.run_id;
            self.apply(RunEvent::RunComplete);
            tracing::info!(
                conversation_id = %self.conversation_id,
                run_id = %run_id,
                steps = self.step,
                "run completed"
            );
            self.emitter.emit(Some(run_id), RunUpdatePayload::RunCompleted);
            self.start_next_from_backlog();
        } else if running.cancellation.is_cancelled() {
            self.fail_run("step cancelled".into());
        } else if self.step >= self.env.config.max_steps_per_run {
            let error = TurnstileError::StepLimitExceeded(self.env.config.max_steps_per_run);
            self.fail_run(error.to_string());
        } else {
            self.spawn_step();
        }
    }

    fn fail_run(&mut self, error: String) {
        tracing::warn!(
            conversation_id = %self.conversation_id,
            run_id = ?self.state.run_id(),
            error = %error,
            "run failed"
        );
        if self.apply(RunEvent::RunError {
            error: error.clone(),
        }) {
            self.last_error = Some(error.clone());
            self.emit(RunUpdatePayload::RunError { error });
            self.settle();
        }
    }

    /// Report a run that just entered `Stopped` and hand its queue to the backlog.
    fn settle(&mut self) {
        let Some(stopped) = self.state.stopped().cloned() else {
            return;
        };
        tracing::info!(
            conversation_id = %self.conversation_id,
            run_id = %stopped.run_id,
            reason = %stopped.reason,
            queued = stopped.queued_messages.len(),
            "run stopped"
        );
        self.emit(RunUpdatePayload::RunStopped {
            reason: stopped.reason,
            queued: stopped.queued_messages.len(),
        });
        self.backlog.extend(stopped.queued_messages);

        if matches!(stopped.reason, StopReason::SoftInterrupt | StopReason::Error) {
            self.start_next_from_backlog();
        }
    }

    fn start_next_from_backlog(&mut self) {
        if let Some(next) = self.backlog.pop_front() {
            self.start_run(next.run_id, next.client_message_id, next.message);
        }
    }

    fn spawn_step(&mut self) {
        let Some(running) = self.state.running() else {
            return;
        };
        if self.self_tx.upgrade().is_none() {
            // Every handle is gone; the inbox is about to close.
            return;
        }
        // Weak so a step stuck on a confirmation cannot keep the inbox open.
        let weak = self.self_tx.clone();
        self.step += 1;
        let run_id = running.run_id;
        let step = self.step;
        let ctx = StepContext {
            conversation_id: self.conversation_id.clone(),
            run_id,
            step,
            transcript: self.transcript.clone(),
            model: self.env.model.clone(),
            tools: self.env.tools.clone(),
            cancellation: running.cancellation.clone(),
            gate: self.gate.clone(),
            observer: self.confirmation_observer(),
            emitter: self.emitter.clone(),
            step_timeout: self.env.config.step_timeout(),
        };

        tracing::debug!(conversation_id = %self.conversation_id, run_id = %run_id, step, "step started");
        self.emit(RunUpdatePayload::StepStarted { step });
        self.step_task = Some(tokio::spawn(async move {
            let outcome = step::execute(ctx).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(DriverCommand::StepFinished {
                    run_id,
                    step,
                    outcome,
                });
            }
        }));
    }

    fn confirmation_observer(&self) -> ConfirmationObserver {
        let weak = self.self_tx.clone();
        Arc::new(move |notice| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(DriverCommand::Confirmation(notice));
            }
        })
    }

    fn confirmation_notice(&mut self, notice: ConfirmationNotice) {
        let current = self.state.running().map(|running| running.run_id);
        match notice {
            ConfirmationNotice::Opened(request) => {
                if current != Some(request.run_id) {
                    return;
                }
                if self.apply(RunEvent::ConfirmationRequested {
                    id: request.id.clone(),
                }) {
                    self.emit(RunUpdatePayload::ConfirmationRequested { request });
                }
            }
            ConfirmationNotice::Closed {
                run_id,
                id,
                decision,
            } => {
                if current != Some(run_id) {
                    return;
                }
                if self.apply(RunEvent::ConfirmationSettled { id: id.clone() }) {
                    self.emit(RunUpdatePayload::ConfirmationResolved {
                        id,
                        approved: decision.is_approved(),
                        reason: decision.reason().map(str::to_string),
                    });
                }
            }
        }
    }

    fn arm_watchdog(&self, run_id: RunId) {
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        let grace = self.env.config.hard_stop_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(DriverCommand::WatchdogFired { run_id });
        });
    }

    fn watchdog_fired(&mut self, run_id: RunId) {
        let Some(running) = self.state.running() else {
            return;
        };
        if running.run_id != run_id {
            return;
        }
        tracing::warn!(
            conversation_id = %self.conversation_id,
            run_id = %run_id,
            step = self.step,
            "step ignored hard stop; forcing the run to settle"
        );
        self.gate.cancel_run(run_id);
        if let Some(task) = self.step_task.take() {
            task.abort();
        }
        self.complete_step(false);
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(DriverSnapshot {
            state: self.state.clone(),
            backlog: self.backlog.iter().cloned().collect(),
            step: self.step,
            transcript_len: self.transcript.len(),
            last_error: self.last_error.clone(),
        });
    }
}
