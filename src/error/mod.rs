//! Error types for Turnstile.

use thiserror::Error;

/// Primary error type for all Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Tool execution error ({tool_name}): {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Step limit exceeded ({0} steps)")]
    StepLimitExceeded(usize),

    #[error("Conversation closed: {0}")]
    ConversationClosed(String),
}

/// Broad error category for routing run-level handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Provider,
    Timeout,
    Configuration,
    Serialization,
    ToolExecution,
    InvalidInput,
    Lifecycle,
}

impl TurnstileError {
    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a tool execution error.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::ConfigParse(_) => ErrorCategory::Configuration,
            Self::Io(_) | Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Provider { .. } => ErrorCategory::Provider,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::InvalidArgument(_) => ErrorCategory::InvalidInput,
            Self::StepLimitExceeded(_) | Self::ConversationClosed(_) => ErrorCategory::Lifecycle,
        }
    }

    /// Whether this error makes continuing the current run meaningless.
    ///
    /// Tool-level failures stay inside the step result so the model can react.
    pub fn ends_run(&self) -> bool {
        !matches!(
            self.category(),
            ErrorCategory::ToolExecution | ErrorCategory::InvalidInput
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TurnstileError>;
