//! Session endpoint: routes conversation-scoped requests to their drivers.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::run::driver::{Dispatch, DriverEnv, DriverHandle, DriverSnapshot, RunDriver};
use crate::run::types::{ClientMessageId, ConfirmationId, InterruptMode, QueuedMessage};

/// Owns one [`RunDriver`] per conversation, spawned on first use.
///
/// The map lock is only held to look up or insert a handle; every request is
/// then serialized by the conversation's own driver.
pub struct RunCoordinator {
    env: DriverEnv,
    drivers: Mutex<HashMap<String, DriverHandle>>,
}

impl RunCoordinator {
    pub fn new(env: DriverEnv) -> Self {
        Self {
            env,
            drivers: Mutex::new(HashMap::new()),
        }
    }

    /// Start a run unless one is already active for the conversation.
    pub async fn start_run(
        &self,
        conversation_id: &str,
        client_message_id: impl Into<ClientMessageId>,
        message: impl Into<String>,
    ) -> Result<Dispatch> {
        self.driver(conversation_id)
            .await
            .start_run(client_message_id, message)
            .await
    }

    /// Start a run, or queue the message as a soft interrupt of the active one.
    pub async fn submit(
        &self,
        conversation_id: &str,
        client_message_id: impl Into<ClientMessageId>,
        message: impl Into<String>,
    ) -> Result<Dispatch> {
        self.driver(conversation_id)
            .await
            .submit(QueuedMessage::new(client_message_id, message))
            .await
    }

    pub async fn interrupt(
        &self,
        conversation_id: &str,
        mode: InterruptMode,
        message: Option<QueuedMessage>,
    ) -> Result<Dispatch> {
        match self.existing(conversation_id).await {
            Some(driver) => driver.interrupt(mode, message).await,
            None => Ok(Dispatch::Ignored),
        }
    }

    pub async fn reset(&self, conversation_id: &str) -> Result<Dispatch> {
        match self.existing(conversation_id).await {
            Some(driver) => driver.reset().await,
            None => Ok(Dispatch::Ignored),
        }
    }

    /// Deliver a confirmation decision. Unknown conversations and ids yield `false`.
    pub async fn resolve_confirmation(
        &self,
        conversation_id: &str,
        id: impl Into<ConfirmationId>,
        approved: bool,
        reason: Option<String>,
    ) -> Result<bool> {
        match self.existing(conversation_id).await {
            Some(driver) => driver.resolve_confirmation(id, approved, reason).await,
            None => Ok(false),
        }
    }

    pub async fn is_running(&self, conversation_id: &str) -> bool {
        self.existing(conversation_id)
            .await
            .is_some_and(|driver| driver.is_running())
    }

    pub async fn snapshot(&self, conversation_id: &str) -> Option<DriverSnapshot> {
        self.existing(conversation_id)
            .await
            .map(|driver| driver.snapshot())
    }

    /// Handle for a conversation's driver, spawning it if needed.
    pub async fn driver(&self, conversation_id: &str) -> DriverHandle {
        let mut drivers = self.drivers.lock().await;
        if let Some(driver) = drivers.get(conversation_id) {
            if !driver.is_closed() {
                return driver.clone();
            }
            tracing::debug!(conversation_id, "respawning closed driver");
        }
        let driver = RunDriver::spawn(conversation_id, self.env.clone());
        drivers.insert(conversation_id.to_string(), driver.clone());
        driver
    }

    /// Shut down and forget a conversation's driver.
    pub async fn evict(&self, conversation_id: &str) -> Result<bool> {
        let removed = self.drivers.lock().await.remove(conversation_id);
        match removed {
            Some(driver) => {
                if !driver.is_closed() {
                    driver.shutdown().await?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn shutdown_all(&self) {
        let drivers: Vec<DriverHandle> = self.drivers.lock().await.drain().map(|(_, d)| d).collect();
        for driver in drivers {
            if let Err(err) = driver.shutdown().await {
                tracing::debug!(
                    conversation_id = driver.conversation_id(),
                    error = %err,
                    "driver already closed"
                );
            }
        }
    }

    pub async fn conversations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn existing(&self, conversation_id: &str) -> Option<DriverHandle> {
        self.drivers
            .lock()
            .await
            .get(conversation_id)
            .filter(|driver| !driver.is_closed())
            .cloned()
    }
}

impl std::fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("tools", &self.env.tools)
            .field("config", &self.env.config)
            .finish_non_exhaustive()
    }
}
