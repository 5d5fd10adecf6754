//! Deterministic model that replays a script of decisions.
//!
//! Backs the CLI demo and the test suites. Each call to
//! [`AgentModel::decide`] pops the next step; an exhausted script answers
//! with a final "Done.".

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AgentModel, Message, ModelDecision, ToolCall};
use crate::error::{Result, TurnstileError};
use crate::tools::ToolDefinition;

/// One scripted decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScriptedStep {
    /// Assistant text emitted with the decision.
    pub say: Option<String>,
    pub reasoning: Option<String>,
    /// Tool to call; absent means this step is the final answer.
    pub tool: Option<String>,
    pub args: serde_json::Value,
    /// Fail the model call with this provider error.
    pub fail: Option<String>,
    /// Simulated provider latency.
    pub delay_ms: Option<u64>,
}

impl ScriptedStep {
    pub fn say(text: impl Into<String>) -> Self {
        Self {
            say: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn tool(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            tool: Some(name.into()),
            args,
            ..Default::default()
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }
}

#[derive(Debug, Deserialize)]
struct ScriptFile {
    #[serde(default)]
    step: Vec<ScriptedStep>,
}

/// Replays [`ScriptedStep`]s in order, across runs.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    steps: Mutex<VecDeque<ScriptedStep>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Parse a TOML script made of `[[step]]` tables.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let script: ScriptFile = toml::from_str(raw)?;
        Ok(Self::new(script.step))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Append more steps to the end of the script.
    pub fn push(&self, step: ScriptedStep) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of decisions served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Option<ScriptedStep> {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

#[async_trait]
impl AgentModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn decide(
        &self,
        _transcript: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<ModelDecision> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(step) = self.next_step() else {
            return Ok(ModelDecision::Final {
                text: "Done.".into(),
            });
        };

        if let Some(delay) = step.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(message) = step.fail {
            return Err(TurnstileError::provider(self.name(), message));
        }

        match step.tool {
            Some(name) => Ok(ModelDecision::UseTools {
                text: step.say,
                reasoning: step.reasoning,
                calls: vec![ToolCall::new(format!("call_{index}"), name, step.args)],
            }),
            None => Ok(ModelDecision::Final {
                text: step.say.unwrap_or_else(|| "Done.".into()),
            }),
        }
    }
}
