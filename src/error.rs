//! Error taxonomy for the agent runtime.
//!
//! One [`AgentError`] enum covers every failure surface the orchestrator,
//! provider drivers, and tool invoker can produce. Recoverable kinds
//! (`ToolValidation`, `ToolExecution`) are caught by the orchestrator and
//! folded into a `ToolResultMessage` instead of ever reaching a caller;
//! everything else propagates as `Result<_, AgentError>`.

use serde_json::Value;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Missing provider, missing API key, invalid schema. Fatal to the call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network failure, timeout, 5xx. Triggers provider fallback.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// 4xx from the provider, or a malformed-request bug in our formatter.
    /// `recoverable` distinguishes "try the next provider" from "this is
    /// our bug and must surface" per the error-handling design.
    #[error("provider error ({provider}): {message}")]
    Provider {
        provider: String,
        message: String,
        raw: Option<Value>,
        recoverable: bool,
    },

    /// Arguments supplied by the model cannot be coerced to the declared
    /// schema. Recovered locally by the orchestrator.
    #[error("tool '{tool}' received invalid arguments: {message}")]
    ToolValidation { tool: String, message: String },

    /// The tool callback itself failed. Recovered locally by the orchestrator.
    #[error("tool '{tool}' execution failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// The provider's response could not be JSON-decoded or coerced to the
    /// declared structured-output schema. Surfaced to the caller.
    #[error("structured output parse error: {message}")]
    StructuredOutputParse { message: String, raw: String },

    /// More tool round-trips than the configured limit. Fatal.
    #[error("tool round-trip limit exceeded: {rounds} rounds (limit {limit})")]
    LoopLimit { rounds: usize, limit: usize },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("all configured providers failed for this turn; last error: {0}")]
    AllProvidersFailed(Box<AgentError>),

    #[error("call was cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        AgentError::Provider {
            provider: provider.into(),
            message: message.into(),
            raw: None,
            recoverable: true,
        }
    }

    pub fn provider_bug(provider: impl Into<String>, message: impl Into<String>) -> Self {
        AgentError::Provider {
            provider: provider.into(),
            message: message.into(),
            raw: None,
            recoverable: false,
        }
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        if let AgentError::Provider { raw: r, .. } = &mut self {
            *r = Some(raw);
        }
        self
    }

    /// Whether the orchestrator should advance to the next fallback provider.
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, AgentError::Transport(_))
            || matches!(self, AgentError::Provider { recoverable: true, .. })
    }

    /// Whether this error is recovered in-loop as a ToolResultMessage rather
    /// than surfaced to the caller.
    pub fn is_tool_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::ToolValidation { .. } | AgentError::ToolExecution { .. }
        )
    }
}
