//! Run coordination: the state machine, the confirmation gate and the
//! per-conversation driver that ties them to model steps.

pub mod confirmation;
pub mod driver;
pub mod events;
pub mod machine;
pub mod state;
pub mod types;

pub use confirmation::{
    ConfirmationDetail, ConfirmationGate, ConfirmationHandle, ConfirmationNotice,
    ConfirmationObserver, ConfirmationRequest, ConfirmationScope, Decision, RUN_CANCELLED,
};
pub use driver::{Dispatch, DriverEnv, DriverHandle, DriverSnapshot, RunDriver, SKIPPED_CANCELLED};
pub use events::{RunUpdate, RunUpdatePayload, UpdateSink, UpdateStream};
pub use machine::{is_noop, transition_run, RunEvent};
pub use state::{RunState, RunningState, StoppedState};
pub use types::{
    ClientMessageId, ConfirmationId, ConversationId, InterruptMode, QueuedMessage, RunId,
    StopMode, StopReason,
};
