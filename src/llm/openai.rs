//! OpenAI-family formatter/driver: the baseline wire shape — messages
//! carry role + text, tools appear as
//! `{type:"function", function:{name, description, parameters}}`, and
//! `tool_choice` may be `"auto"`/`"none"`/`"required"`/a specific function.
//!
//! Transport is reqwest + SSE via `eventsource-stream`.

use crate::config::ProviderConfig;
use crate::error::{AgentError, Result};
use crate::llm::provider::{
    FinishReason, FormatOptions, NormalizedChunk, NormalizedResponse, ProviderDriver,
};
use crate::message::{ContentPart, Message, TokenUsage, ToolCall, UserContent};
use crate::tools::Tool;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::pin::Pin;

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAIDriver {
    client: reqwest::Client,
    api_key: String,
}

impl OpenAIDriver {
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

    fn convert_message(msg: &Message) -> Value {
        match msg {
            Message::System { text, .. } | Message::Developer { text, .. } => {
                json!({ "role": "system", "content": text })
            }
            Message::User { content, .. } => json!({
                "role": "user",
                "content": match content {
                    UserContent::Text(t) => json!(t),
                    UserContent::Parts(parts) => Value::Array(
                        parts
                            .iter()
                            .map(|p| match p {
                                ContentPart::Text { text } => {
                                    json!({"type": "text", "text": text})
                                }
                                ContentPart::ImageUrl { url } => {
                                    json!({"type": "image_url", "image_url": {"url": url}})
                                }
                            })
                            .collect(),
                    ),
                },
            }),
            Message::Assistant { text, .. } | Message::StreamedAssistant { buffer: text, .. } => {
                json!({ "role": "assistant", "content": text })
            }
            Message::ToolCall { calls, .. } => json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": calls.iter().map(|c| json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.tool_name, "arguments": c.arguments_json },
                })).collect::<Vec<_>>(),
            }),
            Message::ToolResult {
                tool_call_id,
                result,
                ..
            } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": result,
            }),
        }
    }

    fn convert_tools(tools: &[Tool]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect()
    }

    fn normalize_finish_reason(raw: &str) -> FinishReason {
        match raw {
            "stop" => FinishReason::Stop,
            "tool_calls" => FinishReason::ToolCalls,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Other,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<UsageField>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ResponseFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
struct UsageField {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsageField>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[async_trait]
impl ProviderDriver for OpenAIDriver {
    fn name(&self) -> &str {
        "openai"
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
            "messages": messages.iter().map(Self::convert_message).collect::<Vec<_>>(),
        });
        let obj = body.as_object_mut().unwrap();

        if !tools.is_empty() {
            obj.insert("tools".into(), Value::Array(Self::convert_tools(tools)));
            if let Some(choice) = &config.tool_choice {
                obj.insert("tool_choice".into(), choice.clone());
            }
            if let Some(parallel) = config.parallel_tool_calls {
                obj.insert("parallel_tool_calls".into(), json!(parallel));
            }
        }
        if let Some(t) = config.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        if let Some(p) = config.top_p {
            obj.insert("top_p".into(), json!(p));
        }
        if let Some(n) = config.n {
            obj.insert("n".into(), json!(n));
        }
        if let Some(fp) = config.frequency_penalty {
            obj.insert("frequency_penalty".into(), json!(fp));
        }
        if let Some(pp) = config.presence_penalty {
            obj.insert("presence_penalty".into(), json!(pp));
        }
        if let Some(max) = config.max_completion_tokens {
            obj.insert("max_completion_tokens".into(), json!(max));
        }
        if let Some(schema) = options.schema {
            obj.insert(
                "response_format".into(),
                json!({
                    "type": "json_schema",
                    "json_schema": { "name": "structured_output", "schema": schema, "strict": true },
                }),
            );
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
            .post(format!("{}/chat/completions", Self::api_base(config)))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(
                "openai",
                format!("HTTP {status}: {body}"),
            ));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AgentError::provider("openai", e.to_string()))?;

        let usage = parsed.usage.map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::provider_bug("openai", "response has no choices"))?;
        let finish_reason = choice
            .finish_reason
            .as_deref()
            .map(Self::normalize_finish_reason)
            .unwrap_or(FinishReason::Other);

        if let Some(tool_calls) = choice.message.tool_calls {
            let calls = tool_calls
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    tool_name: tc.function.name,
                    arguments_json: tc.function.arguments,
                    thought_signature: None,
                })
                .collect();
            Ok(NormalizedResponse::ToolCalls {
                calls,
                usage,
                finish_reason,
            })
        } else {
            Ok(NormalizedResponse::Content {
                text: choice.message.content.unwrap_or_default(),
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
            .map(|o| {
                o.insert("stream".into(), json!(true));
                o.insert("stream_options".into(), json!({"include_usage": true}));
            });

        let response = self
            .client
            .post(format!("{}/chat/completions", Self::api_base(config)))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(
                "openai",
                format!("HTTP {status}: {body}"),
            ));
        }

        let event_stream = response.bytes_stream().eventsource();

        let output = async_stream::stream! {
            futures::pin_mut!(event_stream);

            let mut content_acc = String::new();
            let mut tool_ids: std::collections::HashMap<usize, String> = std::collections::HashMap::new();
            let mut tool_names: std::collections::HashMap<usize, String> = std::collections::HashMap::new();
            let mut tool_args: std::collections::HashMap<usize, String> = std::collections::HashMap::new();
            let mut tool_order: Vec<usize> = Vec::new();
            let mut finish_reason = FinishReason::Stop;
            let mut usage = None;

            while let Some(event) = event_stream.next().await {
                let event = match event {
                    Ok(e) => e,
                    Err(e) => {
                        yield Err(AgentError::provider("openai", format!("stream error: {e}")));
                        return;
                    }
                };
                if event.data == "[DONE]" {
                    break;
                }
                let chunk: StreamChunk = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(AgentError::provider("openai", format!("bad chunk: {e}")));
                        return;
                    }
                };
                if let Some(u) = chunk.usage {
                    usage = Some(TokenUsage::new(u.prompt_tokens, u.completion_tokens));
                }
                for choice in chunk.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() {
                            content_acc.push_str(&content);
                            yield Ok(NormalizedChunk::ContentDelta(content));
                        }
                    }
                    if let Some(deltas) = choice.delta.tool_calls {
                        for delta in deltas {
                            if !tool_order.contains(&delta.index) {
                                tool_order.push(delta.index);
                            }
                            if let Some(id) = delta.id {
                                tool_ids.insert(delta.index, id);
                            }
                            if let Some(f) = delta.function {
                                if let Some(name) = f.name {
                                    tool_names.entry(delta.index).or_default().push_str(&name);
                                }
                                if let Some(args) = f.arguments {
                                    tool_args.entry(delta.index).or_default().push_str(&args);
                                }
                            }
                        }
                    }
                    if let Some(fr) = choice.finish_reason {
                        finish_reason = OpenAIDriver::normalize_finish_reason(&fr);
                    }
                }
            }

            if finish_reason == FinishReason::ToolCalls {
                let calls = tool_order.into_iter().map(|idx| ToolCall {
                    id: tool_ids.get(&idx).cloned().unwrap_or_default(),
                    tool_name: tool_names.get(&idx).cloned().unwrap_or_default(),
                    arguments_json: tool_args.get(&idx).cloned().unwrap_or_default(),
                    thought_signature: None,
                }).collect();
                yield Ok(NormalizedChunk::Done(NormalizedResponse::ToolCalls { calls, usage, finish_reason }));
            } else {
                yield Ok(NormalizedChunk::Done(NormalizedResponse::Content { text: content_acc, usage, finish_reason }));
            }
        };

        Ok(Box::pin(output))
    }

    fn extract_usage(&self, raw: &Value) -> Option<TokenUsage> {
        let usage = raw.get("usage")?;
        let prompt = usage.get("prompt_tokens")?.as_u64()? as u32;
        let completion = usage.get("completion_tokens")?.as_u64()? as u32;
        Some(TokenUsage::new(prompt, completion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;

    fn config() -> ProviderConfig {
        ProviderConfig {
            model: Some("gpt-5-nano".into()),
            ..Default::default()
        }
    }

    #[test]
    fn format_places_system_and_user_in_message_list() {
        let driver = OpenAIDriver::new("key");
        let messages = vec![Message::system("You are helpful."), Message::user("hi")];
        let payload = driver.format(&messages, &[], &FormatOptions::default(), &config());
        let msgs = payload["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[1]["role"], "user");
    }

    #[test]
    fn format_emits_function_type_tools() {
        let driver = OpenAIDriver::new("key");
        let tool = Tool {
            name: "get_weather".into(),
            description: "fetch weather".into(),
            parameters: json!({"type": "object", "properties": {}}),
            required: vec![],
        };
        let payload = driver.format(&[], std::slice::from_ref(&tool), &FormatOptions::default(), &config());
        let tools = payload["tools"].as_array().unwrap();
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "get_weather");
    }

    #[test]
    fn extract_usage_reads_openai_field_names() {
        let driver = OpenAIDriver::new("key");
        let raw = json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5}});
        let usage = driver.extract_usage(&raw).unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn tool_result_formats_with_tool_call_id() {
        let driver = OpenAIDriver::new("key");
        let messages = vec![Message::tool_result("call_1", "get_weather", "32C")];
        let payload = driver.format(&messages, &[], &FormatOptions::default(), &config());
        let msg = &payload["messages"][0];
        assert_eq!(msg["role"], "tool");
        assert_eq!(msg["tool_call_id"], "call_1");
        assert_eq!(msg["content"], "32C");
    }
}
