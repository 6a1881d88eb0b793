//! Gemini generateContent driver: `assistant` becomes the `model` role,
//! `systemInstruction` is a separate top-level field, content is a list of
//! `parts`, and tool declarations live under `functionDeclarations`.
//!
//! Tool-call ids aren't provided by the API and are synthesised
//! sequentially; two parallel function-call parts in one turn share a
//! single thought-signature, attached only to the first.

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
use std::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiDriver {
    client: reqwest::Client,
    api_key: String,
    call_counter: AtomicU64,
}

impl GeminiDriver {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            call_counter: AtomicU64::new(1),
        }
    }

    fn api_base(config: &ProviderConfig) -> String {
        config
            .api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
    }

    fn next_call_id(&self) -> String {
        let idx = self.call_counter.fetch_add(1, Ordering::SeqCst);
        format!("tool_call_{idx}")
    }

    /// Concatenates every `System`/`Developer` message with `\n` (not just
    /// the first one).
    fn extract_system(messages: &[Message]) -> Option<Value> {
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
            Some(json!({ "parts": [{ "text": parts.join("\n") }] }))
        }
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<Value> {
        let mut out = Vec::new();
        for msg in messages {
            match msg {
                Message::System { .. } | Message::Developer { .. } => {}
                Message::User { content, .. } => {
                    out.push(json!({
                        "role": "user",
                        "parts": [{ "text": content.as_text() }],
                    }));
                }
                Message::Assistant { text, .. } | Message::StreamedAssistant { buffer: text, .. } => {
                    out.push(json!({
                        "role": "model",
                        "parts": [{ "text": text }],
                    }));
                }
                Message::ToolCall { calls, .. } => {
                    let parts: Vec<Value> = calls
                        .iter()
                        .enumerate()
                        .map(|(i, c)| {
                            let mut part = json!({
                                "functionCall": {
                                    "name": c.tool_name,
                                    "args": c.arguments().unwrap_or(Value::Null),
                                },
                            });
                            // A shared thought signature is attached to the first
                            // part of a parallel function-call batch only.
                            if i == 0 {
                                if let Some(sig) = &c.thought_signature {
                                    part["thoughtSignature"] = json!(sig);
                                }
                            }
                            part
                        })
                        .collect();
                    out.push(json!({ "role": "model", "parts": parts }));
                }
                Message::ToolResult {
                    tool_name, result, ..
                } => {
                    out.push(json!({
                        "role": "user",
                        "parts": [{
                            "functionResponse": {
                                "name": tool_name,
                                "response": Self::parse_tool_response(result),
                            },
                        }],
                    }));
                }
            }
        }
        out
    }

    fn parse_tool_response(payload: &str) -> Value {
        serde_json::from_str(payload).unwrap_or_else(|_| json!({ "result": payload }))
    }

    fn convert_tools(tools: &[Tool]) -> Vec<Value> {
        vec![json!({
            "functionDeclarations": tools.iter().map(|t| {
                let mut decl = json!({
                    "name": t.name,
                    "description": t.description,
                });
                // Google's API rejects a `parameters` object with no properties
                // for zero-argument tools; omit the field entirely in that case.
                let has_properties = t
                    .parameters
                    .get("properties")
                    .and_then(Value::as_object)
                    .is_some_and(|props| !props.is_empty());
                if has_properties {
                    decl["parameters"] = t.parameters.clone();
                }
                decl
            }).collect::<Vec<_>>(),
        })]
    }

    fn normalize_finish_reason(raw: &str) -> FinishReason {
        match raw {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
            _ => FinishReason::Other,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize, Clone)]
struct Candidate {
    content: Option<ResponseContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(rename = "functionCall", default)]
    function_call: Option<FunctionCall>,
    #[serde(rename = "thoughtSignature", default)]
    thought_signature: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

impl GeminiDriver {
    fn parse_parts(&self, parts: Vec<ResponsePart>) -> (String, Vec<ToolCall>) {
        let mut text = String::new();
        let mut calls = Vec::new();
        for part in parts {
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(fc) = part.function_call {
                calls.push(ToolCall {
                    id: self.next_call_id(),
                    tool_name: fc.name,
                    arguments_json: fc.args.to_string(),
                    thought_signature: part.thought_signature,
                });
            }
        }
        (text, calls)
    }
}

#[async_trait]
impl ProviderDriver for GeminiDriver {
    fn name(&self) -> &str {
        "gemini"
    }

    fn format(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: &FormatOptions,
        config: &ProviderConfig,
    ) -> Value {
        let mut body = json!({
            "contents": self.convert_messages(messages),
        });
        let obj = body.as_object_mut().unwrap();

        if let Some(system) = Self::extract_system(messages) {
            obj.insert("systemInstruction".into(), system);
        }
        if !tools.is_empty() {
            obj.insert("tools".into(), Value::Array(Self::convert_tools(tools)));
            obj.insert(
                "toolConfig".into(),
                json!({ "functionCallingConfig": { "mode": "AUTO" } }),
            );
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(t) = config.temperature {
            generation_config.insert("temperature".into(), json!(t));
        }
        if let Some(max) = config.max_completion_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(max));
        }
        if let Some(schema) = options.schema {
            generation_config.insert("responseMimeType".into(), json!("application/json"));
            generation_config.insert("responseSchema".into(), schema.clone());
        }
        if !generation_config.is_empty() {
            obj.insert("generationConfig".into(), Value::Object(generation_config));
        }
        for (k, v) in &config.extras {
            obj.insert(k.clone(), v.clone());
        }
        body
    }

    async fn send(&self, payload: Value, config: &ProviderConfig) -> Result<NormalizedResponse> {
        let model = config.model.clone().unwrap_or_default();
        let response = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                Self::api_base(config),
                model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(
                "gemini",
                format!("HTTP {status}: {body}"),
            ));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| AgentError::provider("gemini", e.to_string()))?;

        let usage = parsed
            .usage_metadata
            .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count));

        let candidate = parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| AgentError::provider_bug("gemini", "response has no candidates"))?;

        let finish_reason = candidate
            .finish_reason
            .as_deref()
            .map(Self::normalize_finish_reason)
            .unwrap_or(FinishReason::Stop);

        let (text, calls) = self.parse_parts(candidate.content.map(|c| c.parts).unwrap_or_default());

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
        payload: Value,
        config: &ProviderConfig,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<NormalizedChunk>> + Send>>> {
        let model = config.model.clone().unwrap_or_default();
        let response = self
            .client
            .post(format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                Self::api_base(config),
                model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(
                "gemini",
                format!("HTTP {status}: {body}"),
            ));
        }

        let event_stream = response.bytes_stream().eventsource();
        let call_counter_start = self.call_counter.load(Ordering::SeqCst);

        let output = async_stream::stream! {
            futures::pin_mut!(event_stream);

            let mut content_acc = String::new();
            let mut usage = None;
            let mut finish_reason = FinishReason::Stop;
            let mut calls: Vec<ToolCall> = Vec::new();
            let mut next_id = call_counter_start;

            while let Some(event) = event_stream.next().await {
                let event = match event {
                    Ok(e) => e,
                    Err(e) => {
                        yield Err(AgentError::provider("gemini", format!("stream error: {e}")));
                        return;
                    }
                };
                if event.data.trim().is_empty() || event.data == "[DONE]" {
                    continue;
                }
                let chunk: GenerateContentResponse = match serde_json::from_str(&event.data) {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(AgentError::provider("gemini", format!("bad chunk: {e}")));
                        return;
                    }
                };
                if let Some(u) = chunk.usage_metadata {
                    usage = Some(TokenUsage::new(u.prompt_token_count, u.candidates_token_count));
                }
                if let Some(candidate) = chunk.candidates.and_then(|c| c.into_iter().next()) {
                    if let Some(fr) = &candidate.finish_reason {
                        finish_reason = GeminiDriver::normalize_finish_reason(fr);
                    }
                    if let Some(content) = candidate.content {
                        for part in content.parts {
                            if let Some(text) = part.text {
                                if !text.is_empty() {
                                    content_acc.push_str(&text);
                                    yield Ok(NormalizedChunk::ContentDelta(text));
                                }
                            }
                            if let Some(fc) = part.function_call {
                                let id = format!("tool_call_{next_id}");
                                next_id += 1;
                                calls.push(ToolCall {
                                    id,
                                    tool_name: fc.name,
                                    arguments_json: fc.args.to_string(),
                                    thought_signature: part.thought_signature,
                                });
                            }
                        }
                    }
                }
            }

            if !calls.is_empty() {
                yield Ok(NormalizedChunk::Done(NormalizedResponse::ToolCalls { calls, usage, finish_reason }));
            } else {
                yield Ok(NormalizedChunk::Done(NormalizedResponse::Content { text: content_acc, usage, finish_reason }));
            }
        };

        Ok(Box::pin(output))
    }

    fn extract_usage(&self, raw: &Value) -> Option<TokenUsage> {
        let usage = raw.get("usageMetadata")?;
        let prompt = usage.get("promptTokenCount")?.as_u64()? as u32;
        let completion = usage.get("candidatesTokenCount")?.as_u64()? as u32;
        Some(TokenUsage::new(prompt, completion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig {
            model: Some("gemini-3-flash-preview".into()),
            ..Default::default()
        }
    }

    #[test]
    fn format_renames_assistant_to_model_role() {
        let driver = GeminiDriver::new("key");
        let messages = vec![Message::user("hi"), Message::assistant("hello", None)];
        let payload = driver.format(&messages, &[], &FormatOptions::default(), &config());
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn format_concatenates_system_messages_into_system_instruction() {
        let driver = GeminiDriver::new("key");
        let messages = vec![
            Message::system("first."),
            Message::developer("second."),
            Message::user("hi"),
        ];
        let payload = driver.format(&messages, &[], &FormatOptions::default(), &config());
        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            "first.\nsecond."
        );
    }

    #[test]
    fn format_emits_function_declarations_for_tools() {
        let driver = GeminiDriver::new("key");
        let tool = Tool {
            name: "get_weather".into(),
            description: "fetch weather".into(),
            parameters: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
            required: vec!["city".into()],
        };
        let payload = driver.format(&[], std::slice::from_ref(&tool), &FormatOptions::default(), &config());
        let decls = &payload["tools"][0]["functionDeclarations"];
        assert_eq!(decls[0]["name"], "get_weather");
        assert_eq!(decls[0]["parameters"]["properties"]["city"]["type"], "string");
    }

    #[test]
    fn format_omits_parameters_for_a_zero_argument_tool() {
        let driver = GeminiDriver::new("key");
        let tool = Tool {
            name: "ping".into(),
            description: "no-op".into(),
            parameters: json!({"type": "object", "properties": {}}),
            required: vec![],
        };
        let payload = driver.format(&[], std::slice::from_ref(&tool), &FormatOptions::default(), &config());
        let decl = &payload["tools"][0]["functionDeclarations"][0];
        assert!(decl.get("parameters").is_none());
    }

    #[test]
    fn parse_parts_shares_thought_signature_on_first_call_only() {
        let driver = GeminiDriver::new("key");
        let parts = vec![
            ResponsePart {
                text: None,
                function_call: Some(FunctionCall { name: "a".into(), args: json!({}) }),
                thought_signature: Some("sig-1".into()),
            },
            ResponsePart {
                text: None,
                function_call: Some(FunctionCall { name: "b".into(), args: json!({}) }),
                thought_signature: None,
            },
        ];
        let (_, calls) = driver.parse_parts(parts);
        assert_eq!(calls[0].thought_signature.as_deref(), Some("sig-1"));
        assert_eq!(calls[1].thought_signature, None);
    }
}
