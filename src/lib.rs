//! Turnstile: run coordination for interruptible, human-gated agent conversations.
//!
//! Each conversation gets a single-writer [`RunDriver`](run::RunDriver) that
//! owns its run state. Users can redirect a run with a soft interrupt (finish
//! the current step, then start on the queued message) or halt it with a hard
//! stop (cancel now, discard the queue). Side-effecting tools suspend on a
//! [`ConfirmationGate`](run::ConfirmationGate) until the user approves or denies.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use turnstile::prelude::*;
//!
//! # async fn example() -> turnstile::error::Result<()> {
//! let model = Arc::new(ScriptedModel::new([ScriptedStep::say("Hi there")]));
//! let coordinator = RunCoordinator::new(DriverEnv::new(model));
//! coordinator.submit("conversation-1", "msg-1", "Hello!").await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod prelude;
pub mod run;
pub mod session;
pub mod tools;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
