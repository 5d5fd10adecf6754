//! Confirmation gate: suspends a tool call until a human decides.
//!
//! Requests live in a pending table keyed by correlation id. Each entry owns
//! the sending half of a oneshot channel, so an id resolves at most once:
//! whoever removes the entry first (a decision, run cancellation, or the
//! waiter being dropped) wins and every later resolution is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::types::{ConfirmationId, RunId};

/// Denial reason used when the owning run is hard-stopped.
pub const RUN_CANCELLED: &str = "run cancelled";

/// A pending approval surfaced to the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmationRequest {
    pub id: ConfirmationId,
    pub run_id: RunId,
    pub tool_name: String,
    #[serde(default)]
    pub tool_args: serde_json::Value,
    /// What the tool wants to do, e.g. "execute".
    pub action: String,
    /// The resource the action applies to, e.g. a command line or path.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_message: Option<String>,
}

/// Tool-supplied description of the action awaiting approval.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationDetail {
    pub tool_name: String,
    pub tool_args: serde_json::Value,
    pub message: Option<String>,
}

/// Outcome of a confirmation request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approved {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Denied {
        reason: String,
    },
}

impl Decision {
    pub fn approve() -> Self {
        Self::Approved { note: None }
    }

    pub fn approve_with(note: impl Into<String>) -> Self {
        Self::Approved {
            note: Some(note.into()),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }

    /// Synthetic denial handed to waiters of a cancelled run.
    pub fn cancelled() -> Self {
        Self::deny(RUN_CANCELLED)
    }

    /// Build from the endpoint's `(approved, reason?)` pair.
    pub fn from_parts(approved: bool, reason: Option<String>) -> Self {
        if approved {
            Self::Approved { note: reason }
        } else {
            Self::deny(reason.unwrap_or_else(|| "denied by user".to_string()))
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    pub fn denial_reason(&self) -> Option<&str> {
        match self {
            Self::Denied { reason } => Some(reason),
            Self::Approved { .. } => None,
        }
    }

    /// Note (approval) or reason (denial), whichever applies.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Approved { note } => note.as_deref(),
            Self::Denied { reason } => Some(reason),
        }
    }
}

/// Lifecycle notifications delivered to the owning run's driver.
#[derive(Debug, Clone)]
pub enum ConfirmationNotice {
    Opened(ConfirmationRequest),
    Closed {
        run_id: RunId,
        id: ConfirmationId,
        decision: Decision,
    },
}

/// Callback that surfaces confirmation lifecycle to the driver.
pub type ConfirmationObserver = Arc<dyn Fn(ConfirmationNotice) + Send + Sync>;

/// The owning run's side of a confirmation: who asks and how to abort.
#[derive(Clone)]
pub struct ConfirmationScope {
    pub run_id: RunId,
    pub cancellation: CancellationToken,
    pub observer: Option<ConfirmationObserver>,
}

impl ConfirmationScope {
    pub fn new(run_id: RunId, cancellation: CancellationToken) -> Self {
        Self {
            run_id,
            cancellation,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: ConfirmationObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn notify(&self, notice: ConfirmationNotice) {
        if let Some(observer) = &self.observer {
            observer(notice);
        }
    }
}

impl std::fmt::Debug for ConfirmationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationScope")
            .field("run_id", &self.run_id)
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("observer", &self.observer.as_ref().map(|_| ".."))
            .finish()
    }
}

struct PendingConfirmation {
    run_id: RunId,
    cancellation: CancellationToken,
    tx: oneshot::Sender<Decision>,
}

/// Pending-request table correlating tool requests with user decisions.
#[derive(Default)]
pub struct ConfirmationGate {
    pending: Mutex<HashMap<ConfirmationId, PendingConfirmation>>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for approval and wait until a decision arrives or the run is
    /// cancelled. Never fails: cancellation yields [`Decision::cancelled`].
    pub async fn request(
        &self,
        action: impl Into<String>,
        target: impl Into<String>,
        scope: &ConfirmationScope,
        detail: ConfirmationDetail,
    ) -> Decision {
        if scope.cancellation.is_cancelled() {
            return Decision::cancelled();
        }

        let id: ConfirmationId = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.table().insert(
            id.clone(),
            PendingConfirmation {
                run_id: scope.run_id,
                cancellation: scope.cancellation.clone(),
                tx,
            },
        );
        let mut guard = PendingGuard {
            gate: self,
            id: id.clone(),
            scope,
            decision: None,
        };

        let request = ConfirmationRequest {
            id: id.clone(),
            run_id: scope.run_id,
            tool_name: detail.tool_name,
            tool_args: detail.tool_args,
            action: action.into(),
            target: target.into(),
            additional_message: detail.message,
        };
        tracing::debug!(
            run_id = %scope.run_id,
            confirmation_id = %id,
            tool = %request.tool_name,
            "confirmation requested"
        );
        scope.notify(ConfirmationNotice::Opened(request));

        let decision = tokio::select! {
            biased;
            _ = scope.cancellation.cancelled() => Decision::cancelled(),
            resolved = rx => resolved.unwrap_or_else(|_| Decision::cancelled()),
        };
        guard.decision = Some(decision.clone());
        decision
    }

    /// Deliver a decision. Returns `false` for unknown or already-resolved ids,
    /// and for requests whose run was cancelled before the waiter saw it.
    pub fn resolve(&self, id: &str, decision: Decision) -> bool {
        let Some(entry) = self.table().remove(id) else {
            tracing::warn!(confirmation_id = %id, "ignoring resolution for unknown confirmation");
            return false;
        };
        if entry.cancellation.is_cancelled() {
            tracing::debug!(
                run_id = %entry.run_id,
                confirmation_id = %id,
                "ignoring resolution for cancelled run"
            );
            let _ = entry.tx.send(Decision::cancelled());
            return false;
        }
        tracing::debug!(
            run_id = %entry.run_id,
            confirmation_id = %id,
            approved = decision.is_approved(),
            "confirmation resolved"
        );
        entry.tx.send(decision).is_ok()
    }

    /// Deny every pending request owned by `run_id`. Returns how many were open.
    pub fn cancel_run(&self, run_id: RunId) -> usize {
        let abandoned: Vec<PendingConfirmation> = {
            let mut table = self.table();
            let ids: Vec<ConfirmationId> = table
                .iter()
                .filter(|(_, entry)| entry.run_id == run_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        let count = abandoned.len();
        for entry in abandoned {
            let _ = entry.tx.send(Decision::cancelled());
        }
        count
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.table().contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<ConfirmationId, PendingConfirmation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConfirmationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationGate")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Clears the table entry and reports closure even if the waiter is dropped.
struct PendingGuard<'a> {
    gate: &'a ConfirmationGate,
    id: ConfirmationId,
    scope: &'a ConfirmationScope,
    decision: Option<Decision>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.gate.table().remove(&self.id);
        let decision = self.decision.take().unwrap_or_else(Decision::cancelled);
        self.scope.notify(ConfirmationNotice::Closed {
            run_id: self.scope.run_id,
            id: self.id.clone(),
            decision,
        });
    }
}

/// Confirmation capability handed to tools through their context.
#[derive(Clone, Debug)]
pub struct ConfirmationHandle {
    gate: Arc<ConfirmationGate>,
    scope: ConfirmationScope,
}

impl ConfirmationHandle {
    pub fn new(gate: Arc<ConfirmationGate>, scope: ConfirmationScope) -> Self {
        Self { gate, scope }
    }

    pub fn run_id(&self) -> RunId {
        self.scope.run_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.scope.cancellation
    }

    pub async fn request(
        &self,
        action: impl Into<String>,
        target: impl Into<String>,
        detail: ConfirmationDetail,
    ) -> Decision {
        self.gate.request(action, target, &self.scope, detail).await
    }
}
