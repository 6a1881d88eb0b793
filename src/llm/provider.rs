//! The `ProviderDriver` contract: normalises messages/tools for one
//! provider family, sends the request, and parses the response back into
//! the internal `Message` model — including streaming.
//!
//! The tool-calling loop lives in the `AgentOrchestrator`, not here; a
//! driver's job is just the four methods below — format, send, stream,
//! and extract usage.

use crate::config::ProviderConfig;
use crate::error::{AgentError, Result};
use crate::message::{Message, TokenUsage, ToolCall};
use crate::tools::Tool;
use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other,
}

/// A provider's response, already normalised to the internal model.
#[derive(Debug, Clone)]
pub enum NormalizedResponse {
    Content {
        text: String,
        usage: Option<TokenUsage>,
        finish_reason: FinishReason,
    },
    ToolCalls {
        calls: Vec<ToolCall>,
        usage: Option<TokenUsage>,
        finish_reason: FinishReason,
    },
}

impl NormalizedResponse {
    pub fn finish_reason(&self) -> FinishReason {
        match self {
            NormalizedResponse::Content { finish_reason, .. } => *finish_reason,
            NormalizedResponse::ToolCalls { finish_reason, .. } => *finish_reason,
        }
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        match self {
            NormalizedResponse::Content { usage, .. } => *usage,
            NormalizedResponse::ToolCalls { usage, .. } => *usage,
        }
    }
}

/// One incremental piece of a streamed response.
#[derive(Debug, Clone)]
pub enum NormalizedChunk {
    ContentDelta(String),
    Done(NormalizedResponse),
}

/// Extra per-call formatting input beyond messages/tools/config.
#[derive(Default)]
pub struct FormatOptions<'a> {
    /// A structured-output schema to forward, if the caller declared one.
    pub schema: Option<&'a Value>,
}

/// Provider-specific adapter implementing the normalisation contract.
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Short identifier used in fallback sequences, usage records, and
    /// diagnostics (e.g. `"openai"`, `"anthropic"`, `"gemini"`).
    fn name(&self) -> &str;

    /// Format messages/tools/schema into this family's wire payload.
    fn format(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &FormatOptions,
        config: &ProviderConfig,
    ) -> Value;

    /// Send a non-streamed request, returning the normalised response.
    async fn send(&self, payload: Value, config: &ProviderConfig) -> Result<NormalizedResponse>;

    /// Send a streamed request; the stream yields content deltas followed by
    /// a final `Done` chunk carrying the normalised response.
    async fn send_streamed(
        &self,
        payload: Value,
        config: &ProviderConfig,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<NormalizedChunk>> + Send>>>;

    /// Read `{prompt, completion, total}` out of a raw provider payload,
    /// regardless of the family's native field names.
    fn extract_usage(&self, raw: &Value) -> Option<TokenUsage>;
}

/// Strip a ```json ... ``` (or bare ```) fence from a structured-output
/// payload before JSON-decoding, since models often wrap schema-conforming
/// JSON in a markdown code block despite being asked not to.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse structured-output content as JSON, retrying with the fence
/// stripped on first failure.
pub fn parse_structured_output(text: &str) -> Result<Value> {
    serde_json::from_str::<Value>(text)
        .or_else(|_| serde_json::from_str::<Value>(strip_code_fence(text)))
        .map_err(|e| AgentError::StructuredOutputParse {
            message: e.to_string(),
            raw: text.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fence_removes_json_fence() {
        let text = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_code_fence(text), "{\"a\":1}");
    }

    #[test]
    fn strip_code_fence_removes_bare_fence() {
        let text = "```\n{\"a\":1}\n```";
        assert_eq!(strip_code_fence(text), "{\"a\":1}");
    }

    #[test]
    fn parse_structured_output_falls_back_to_fenced_content() {
        let text = "```json\n{\"a\":1}\n```";
        let value = parse_structured_output(text).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn parse_structured_output_surfaces_error_on_garbage() {
        let err = parse_structured_output("not json").unwrap_err();
        assert!(matches!(err, AgentError::StructuredOutputParse { .. }));
    }
}
