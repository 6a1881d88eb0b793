//! Anthropic Messages API driver: a `system` string carried outside the
//! `messages` array, content as typed blocks (`text`/`tool_use`/
//! `tool_result`), and `input_schema` for tool declarations.
//!
//! Every `System`/`Developer` message is concatenated with `\n` into the
//! outgoing `system` field, rather than keeping only the first one.

use crate::config::ProviderConfig;
use crate::error::{AgentError, Result};
use crate::llm::provider::{
    FinishReason, FormatOptions, NormalizedChunk, NormalizedResponse, ProviderDriver,
};
use crate::message::{Message, TokenUsage, ToolCall};
use crate::tools::Tool;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::pin::Pin;

const DEFAULT_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicDriver {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicDriver {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }

    fn api_base(config: &ProviderConfig) -> String {
        config
            .api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
    }

    /// Concatenates every `System`/`Developer` message with `\n`.
    fn extract_system(messages: &[Message]) -> Option<String> {
        let parts: Vec<&str> = messages
            .iter()
            .filter_map(|m| match m {
                Message::System { text, .. } | Message::Developer { text, .. } => {
                    Some(text.as_str())
                }
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        let mut out = Vec::new();
        for msg in messages {
            match msg {
                Message::System { .. } | Message::Developer { .. } => {}
                Message::User { content, .. } => {
                    out.push(json!({ "role": "user", "content": content.as_text() }));
                }
                Message::Assistant { text, .. } | Message::StreamedAssistant { buffer: text, .. } => {
                    if !text.is_empty() {
                        out.push(json!({
                            "role": "assistant",
                            "content": [{ "type": "text", "text": text }],
                        }));
                    }
                }
                Message::ToolCall { calls, .. } => {
                    let blocks: Vec<Value> = calls
                        .iter()
                        .map(|c| {
                            json!({
                                "type": "tool_use",
                                "id": c.id,
                                "name": c.tool_name,
                                "input": c.arguments().unwrap_or(Value::Null),
                            })
                        })
                        .collect();
                    out.push(json!({ "role": "assistant", "content": blocks }));
                }
                Message::ToolResult {
                    tool_call_id,
                    result,
                    ..
                } => {
                    out.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": tool_call_id,
                            "content": result,
                        }],
                    }));
                }
            }
        }
        out
    }

    fn convert_tools(tools: &[Tool]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect()
    }

    fn normalize_finish_reason(raw: &str) -> FinishReason {
        match raw {
            "end_turn" | "stop_sequence" => FinishReason::Stop,
            "tool_use" => FinishReason::ToolCalls,
            "max_tokens" => FinishReason::Length,
            _ => FinishReason::Other,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateMessageResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageStartContent,
}

#[derive(Debug, Deserialize)]
struct MessageStartContent {
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: StartBlock,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StartBlock {
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    index: usize,
    delta: Delta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Delta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaContent,
    #[serde(default)]
    usage: Option<MessageDeltaUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaContent {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaUsage {
    output_tokens: u32,
}

#[async_trait]
impl ProviderDriver for AnthropicDriver {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn format(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &FormatOptions,
        config: &ProviderConfig,
    ) -> Value {
        let mut body = json!({
            "model": config.model.clone().unwrap_or_default(),
            "max_tokens": config.max_completion_tokens.unwrap_or(4096),
            "messages": Self::convert_messages(messages),
        });
        let obj = body.as_object_mut().unwrap();

        if let Some(system) = Self::extract_system(messages) {
            obj.insert("system".into(), json!(system));
        }
        if !tools.is_empty() {
            obj.insert("tools".into(), Value::Array(Self::convert_tools(tools)));
        }
        if let Some(t) = config.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = config.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if options.schema.is_some() {
            // Anthropic has no native JSON-Schema response mode; structured
            // output is carried as an instruction in the system prompt by
            // the caller and parsed back via `parse_structured_output`.
        }
        for (k, v) in &config.extras {
            obj.insert(k.clone(), v.clone());
        }
        body
    }

    async fn send(&self, mut payload: Value, config: &ProviderConfig) -> Result<NormalizedResponse> {
        payload
            .as_object_mut()
            .map(|o| o.insert("stream".into(), json!(false)));

        let response = self
            .client
            .post(format!("{}/messages", Self::api_base(config)))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(
                "anthropic",
                format!("HTTP {status}: {body}"),
            ));
        }

        let parsed: CreateMessageResponse = response
            .json()
            .await
            .map_err(|e| AgentError::provider("anthropic", e.to_string()))?;

        let usage = Some(TokenUsage::new(
            parsed.usage.input_tokens,
            parsed.usage.output_tokens,
        ));
        let finish_reason = parsed
            .stop_reason
            .as_deref()
            .map(Self::normalize_finish_reason)
            .unwrap_or(FinishReason::Stop);

        let mut text = String::new();
        let mut calls = Vec::new();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                ContentBlock::ToolUse { id, name, input } => calls.push(ToolCall {
                    id,
                    tool_name: name,
                    arguments_json: input.to_string(),
                    thought_signature: None,
                }),
                ContentBlock::Other => {}
            }
        }

        if !calls.is_empty() {
            Ok(NormalizedResponse::ToolCalls {
                calls,
                usage,
                finish_reason,
            })
        } else {
            Ok(NormalizedResponse::Content {
                text,
                usage,
                finish_reason,
            })
        }
    }

    async fn send_streamed(
        &self,
        mut payload: Value,
        config: &ProviderConfig,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<NormalizedChunk>> + Send>>> {
        payload
            .as_object_mut()
            .map(|o| o.insert("stream".into(), json!(true)));

        let response = self
            .client
            .post(format!("{}/messages", Self::api_base(config)))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(
                "anthropic",
                format!("HTTP {status}: {body}"),
            ));
        }

        let event_stream = response.bytes_stream().eventsource();

        let output = async_stream::stream! {
            futures::pin_mut!(event_stream);

            let mut content_acc = String::new();
            let mut input_tokens = 0u32;
            let mut output_tokens = 0u32;
            let mut stop_reason: Option<String> = None;
            let mut current_tool: Option<(String, String, String)> = None;
            let mut calls: Vec<ToolCall> = Vec::new();

            while let Some(event) = event_stream.next().await {
                let event = match event {
                    Ok(e) => e,
                    Err(e) => {
                        yield Err(AgentError::provider("anthropic", format!("stream error: {e}")));
                        return;
                    }
                };
                if event.event == "message_stop" {
                    break;
                }
                if event.data.trim().is_empty() {
                    continue;
                }
                match event.event.as_str() {
                    "message_start" => {
                        if let Ok(start) = serde_json::from_str::<MessageStart>(&event.data) {
                            input_tokens = start.message.usage.input_tokens;
                        }
                    }
                    "content_block_start" => {
                        if let Ok(start) = serde_json::from_str::<ContentBlockStart>(&event.data) {
                            if let StartBlock::ToolUse { id, name } = start.content_block {
                                current_tool = Some((id, name, String::new()));
                            }
                        }
                    }
                    "content_block_delta" => {
                        if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(&event.data) {
                            match delta.delta {
                                Delta::TextDelta { text } => {
                                    content_acc.push_str(&text);
                                    yield Ok(NormalizedChunk::ContentDelta(text));
                                }
                                Delta::InputJsonDelta { partial_json } => {
                                    if let Some((_, _, json)) = current_tool.as_mut() {
                                        json.push_str(&partial_json);
                                    }
                                }
                                Delta::Other => {}
                            }
                        }
                    }
                    "content_block_stop" => {
                        if let Some((id, name, args)) = current_tool.take() {
                            calls.push(ToolCall {
                                id,
                                tool_name: name,
                                arguments_json: if args.is_empty() { "{}".to_string() } else { args },
                                thought_signature: None,
                            });
                        }
                    }
                    "message_delta" => {
                        if let Ok(delta) = serde_json::from_str::<MessageDelta>(&event.data) {
                            stop_reason = delta.delta.stop_reason;
                            if let Some(u) = delta.usage {
                                output_tokens = u.output_tokens;
                            }
                        }
                    }
                    _ => {}
                }
            }

            let usage = Some(TokenUsage::new(input_tokens, output_tokens));
            let finish_reason = stop_reason
                .as_deref()
                .map(AnthropicDriver::normalize_finish_reason)
                .unwrap_or(FinishReason::Stop);

            if !calls.is_empty() {
                yield Ok(NormalizedChunk::Done(NormalizedResponse::ToolCalls { calls, usage, finish_reason }));
            } else {
                yield Ok(NormalizedChunk::Done(NormalizedResponse::Content { text: content_acc, usage, finish_reason }));
            }
        };

        Ok(Box::pin(output))
    }

    fn extract_usage(&self, raw: &Value) -> Option<TokenUsage> {
        let usage = raw.get("usage")?;
        let input = usage.get("input_tokens")?.as_u64()? as u32;
        let output = usage.get("output_tokens")?.as_u64()? as u32;
        Some(TokenUsage::new(input, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig {
            model: Some("claude-sonnet-4-5-20250929".into()),
            ..Default::default()
        }
    }

    #[test]
    fn format_concatenates_all_system_messages() {
        let driver = AnthropicDriver::new("key");
        let messages = vec![
            Message::system("first instruction."),
            Message::developer("second instruction."),
            Message::user("hi"),
        ];
        let payload = driver.format(&messages, &[], &FormatOptions::default(), &config());
        assert_eq!(payload["system"], "first instruction.\nsecond instruction.");
        // only the user turn lands in `messages`
        assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn format_emits_input_schema_for_tools() {
        let driver = AnthropicDriver::new("key");
        let tool = Tool {
            name: "get_weather".into(),
            description: "fetch weather".into(),
            parameters: json!({"type": "object", "properties": {}}),
            required: vec![],
        };
        let payload = driver.format(&[], std::slice::from_ref(&tool), &FormatOptions::default(), &config());
        assert_eq!(payload["tools"][0]["input_schema"]["type"], "object");
    }

    #[test]
    fn tool_result_becomes_user_tool_result_block() {
        let driver = AnthropicDriver::new("key");
        let messages = vec![Message::tool_result("call_1", "get_weather", "32C")];
        let payload = driver.format(&messages, &[], &FormatOptions::default(), &config());
        let msg = &payload["messages"][0];
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["content"][0]["type"], "tool_result");
        assert_eq!(msg["content"][0]["tool_use_id"], "call_1");
    }

    #[test]
    fn extract_usage_reads_input_output_tokens() {
        let driver = AnthropicDriver::new("key");
        let raw = json!({"usage": {"input_tokens": 7, "output_tokens": 3}});
        let usage = driver.extract_usage(&raw).unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
    }
}
