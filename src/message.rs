//! The polymorphic message model.
//!
//! A tagged union discriminated by `Role`, so a wire-format mismatch
//! between variants is a compile-time-prevented mistake rather than a
//! runtime one.
//!
//! Wire form of every message is a JSON object with at least
//! `{role, content, message_uuid, message_created}` plus variant-specific
//! fields. For `ToolResultMessage`, `tool_name` is emitted at the top level
//! of that object (not nested under `content`) — reading falls back to a
//! nested `content.tool_name` for backward compatibility with records
//! written before this was fixed. Fields the model doesn't recognise land
//! in `extras` and are re-emitted unchanged, so
//! `deserialize(serialize(m)) == m` holds even for payloads produced by a
//! newer wire dialect than this crate understands.

use chrono::{DateTime, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Developer => "developer",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    fn parse(s: &str) -> Option<Role> {
        match s {
            "system" => Some(Role::System),
            "developer" => Some(Role::Developer),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A single content part of a `UserMessage`: text or an image reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
}

/// `UserMessage` content is either plain text or a sequence of parts.
#[derive(Debug, Clone, PartialEq)]
pub enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl UserContent {
    /// A best-effort flattening to plain text, used for token estimation
    /// and log lines; not the wire representation.
    pub fn as_text(&self) -> String {
        match self {
            UserContent::Text(t) => t.clone(),
            UserContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.clone()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    /// Raw JSON text as emitted by the model; not parsed eagerly so that a
    /// malformed or provider-specific argument shape is preserved losslessly
    /// until a tool actually needs it.
    pub arguments_json: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub thought_signature: Option<String>,
}

impl ToolCall {
    pub fn arguments(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.arguments_json)
    }
}

fn new_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Envelope fields shared by every message variant.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<Value>,
    pub extras: Map<String, Value>,
}

impl Envelope {
    fn fresh() -> Self {
        Self {
            id: new_id(),
            created_at: now(),
            metadata: None,
            extras: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    System {
        envelope: Envelope,
        text: String,
    },
    Developer {
        envelope: Envelope,
        text: String,
    },
    User {
        envelope: Envelope,
        content: UserContent,
    },
    Assistant {
        envelope: Envelope,
        text: String,
        usage: Option<TokenUsage>,
    },
    StreamedAssistant {
        envelope: Envelope,
        buffer: String,
        complete: bool,
    },
    ToolCall {
        envelope: Envelope,
        calls: Vec<ToolCall>,
    },
    ToolResult {
        envelope: Envelope,
        tool_call_id: String,
        tool_name: String,
        result: String,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Message::System {
            envelope: Envelope::fresh(),
            text: text.into(),
        }
    }

    pub fn developer(text: impl Into<String>) -> Self {
        Message::Developer {
            envelope: Envelope::fresh(),
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Message::User {
            envelope: Envelope::fresh(),
            content: UserContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Message::User {
            envelope: Envelope::fresh(),
            content: UserContent::Parts(parts),
        }
    }

    pub fn assistant(text: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Message::Assistant {
            envelope: Envelope::fresh(),
            text: text.into(),
            usage,
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Message::ToolCall {
            envelope: Envelope::fresh(),
            calls,
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Message::ToolResult {
            envelope: Envelope::fresh(),
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            result: result.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::Developer { .. } => Role::Developer,
            Message::User { .. } => Role::User,
            Message::Assistant { .. } => Role::Assistant,
            Message::StreamedAssistant { .. } => Role::Assistant,
            Message::ToolCall { .. } => Role::Assistant,
            Message::ToolResult { .. } => Role::Tool,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        match self {
            Message::System { envelope, .. }
            | Message::Developer { envelope, .. }
            | Message::User { envelope, .. }
            | Message::Assistant { envelope, .. }
            | Message::StreamedAssistant { envelope, .. }
            | Message::ToolCall { envelope, .. }
            | Message::ToolResult { envelope, .. } => envelope,
        }
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        match self {
            Message::System { envelope, .. }
            | Message::Developer { envelope, .. }
            | Message::User { envelope, .. }
            | Message::Assistant { envelope, .. }
            | Message::StreamedAssistant { envelope, .. }
            | Message::ToolCall { envelope, .. }
            | Message::ToolResult { envelope, .. } => envelope,
        }
    }

    pub fn id(&self) -> &str {
        &self.envelope().id
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.envelope_mut().metadata = Some(metadata);
        self
    }

    /// A best-effort plain-text rendering, used for logging and for the
    /// character-based token estimate in the truncation engine.
    pub fn text_for_estimate(&self) -> String {
        match self {
            Message::System { text, .. } | Message::Developer { text, .. } => text.clone(),
            Message::User { content, .. } => content.as_text(),
            Message::Assistant { text, .. } => text.clone(),
            Message::StreamedAssistant { buffer, .. } => buffer.clone(),
            Message::ToolCall { calls, .. } => calls
                .iter()
                .map(|c| format!("{}({})", c.tool_name, c.arguments_json))
                .collect::<Vec<_>>()
                .join(" "),
            Message::ToolResult { result, .. } => result.clone(),
        }
    }

    /// Serialise to the wire map described in the module doc comment.
    pub fn to_wire(&self) -> Value {
        let envelope = self.envelope();
        let mut map = Map::new();
        map.insert("role".into(), Value::String(self.role().as_str().into()));
        map.insert("message_uuid".into(), Value::String(envelope.id.clone()));
        map.insert(
            "message_created".into(),
            Value::String(envelope.created_at.to_rfc3339()),
        );
        if let Some(meta) = &envelope.metadata {
            map.insert("metadata".into(), meta.clone());
        }

        match self {
            Message::System { text, .. } | Message::Developer { text, .. } => {
                map.insert("content".into(), Value::String(text.clone()));
            }
            Message::User { content, .. } => {
                let value = match content {
                    UserContent::Text(t) => Value::String(t.clone()),
                    UserContent::Parts(parts) => {
                        Value::Array(parts.iter().map(|p| serde_json::to_value(p).unwrap()).collect())
                    }
                };
                map.insert("content".into(), value);
            }
            Message::Assistant { text, usage, .. } => {
                map.insert("content".into(), Value::String(text.clone()));
                if let Some(u) = usage {
                    map.insert("usage".into(), serde_json::to_value(u).unwrap());
                }
            }
            Message::StreamedAssistant {
                buffer, complete, ..
            } => {
                map.insert("content".into(), Value::String(buffer.clone()));
                map.insert("complete".into(), Value::Bool(*complete));
            }
            Message::ToolCall { calls, .. } => {
                map.insert(
                    "content".into(),
                    Value::Array(calls.iter().map(|c| serde_json::to_value(c).unwrap()).collect()),
                );
            }
            Message::ToolResult {
                tool_call_id,
                tool_name,
                result,
                ..
            } => {
                // tool_name lives at the top level, not nested under
                // content, so a reader that only looks at `content` can
                // never silently lose it.
                map.insert("content".into(), Value::String(result.clone()));
                map.insert("tool_call_id".into(), Value::String(tool_call_id.clone()));
                map.insert("tool_name".into(), Value::String(tool_name.clone()));
            }
        }

        for (k, v) in &envelope.extras {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }

        Value::Object(map)
    }

    /// Parse a wire map back into a `Message`. Unrecognised fields are
    /// deposited in `extras` so a subsequent `to_wire()` reproduces them.
    pub fn from_wire(value: &Value) -> Result<Message, MessageDecodeError> {
        let obj = value
            .as_object()
            .ok_or(MessageDecodeError::NotAnObject)?;

        let role_str = obj
            .get("role")
            .and_then(Value::as_str)
            .ok_or(MessageDecodeError::MissingField("role"))?;
        let role = Role::parse(role_str).ok_or(MessageDecodeError::UnknownRole(role_str.into()))?;

        let id = obj
            .get("message_uuid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(new_id);
        let created_at = obj
            .get("message_created")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(now);
        let metadata = obj.get("metadata").cloned();

        let mut known: std::collections::HashSet<&str> = [
            "role",
            "content",
            "message_uuid",
            "message_created",
            "metadata",
        ]
        .into_iter()
        .collect();

        let content = obj.get("content");

        let message = match role {
            Role::System => Message::System {
                envelope: Envelope {
                    id,
                    created_at,
                    metadata,
                    extras: Map::new(),
                },
                text: content.and_then(Value::as_str).unwrap_or_default().to_string(),
            },
            Role::Developer => Message::Developer {
                envelope: Envelope {
                    id,
                    created_at,
                    metadata,
                    extras: Map::new(),
                },
                text: content.and_then(Value::as_str).unwrap_or_default().to_string(),
            },
            Role::User => {
                let user_content = match content {
                    Some(Value::String(s)) => UserContent::Text(s.clone()),
                    Some(Value::Array(parts)) => {
                        let parsed = parts
                            .iter()
                            .filter_map(|p| serde_json::from_value::<ContentPart>(p.clone()).ok())
                            .collect();
                        UserContent::Parts(parsed)
                    }
                    _ => UserContent::Text(String::new()),
                };
                Message::User {
                    envelope: Envelope {
                        id,
                        created_at,
                        metadata,
                        extras: Map::new(),
                    },
                    content: user_content,
                }
            }
            Role::Assistant => {
                known.insert("usage");
                known.insert("complete");
                let is_tool_call_array = matches!(content, Some(Value::Array(_)))
                    && obj.get("complete").is_none();
                if is_tool_call_array {
                    let calls = content
                        .and_then(Value::as_array)
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|c| serde_json::from_value::<ToolCall>(c.clone()).ok())
                                .collect()
                        })
                        .unwrap_or_default();
                    Message::ToolCall {
                        envelope: Envelope {
                            id,
                            created_at,
                            metadata,
                            extras: Map::new(),
                        },
                        calls,
                    }
                } else if let Some(complete) = obj.get("complete").and_then(Value::as_bool) {
                    Message::StreamedAssistant {
                        envelope: Envelope {
                            id,
                            created_at,
                            metadata,
                            extras: Map::new(),
                        },
                        buffer: content.and_then(Value::as_str).unwrap_or_default().to_string(),
                        complete,
                    }
                } else {
                    let usage = obj
                        .get("usage")
                        .and_then(|v| serde_json::from_value::<TokenUsage>(v.clone()).ok());
                    Message::Assistant {
                        envelope: Envelope {
                            id,
                            created_at,
                            metadata,
                            extras: Map::new(),
                        },
                        text: content.and_then(Value::as_str).unwrap_or_default().to_string(),
                        usage,
                    }
                }
            }
            Role::Tool => {
                known.insert("tool_call_id");
                known.insert("tool_name");
                let tool_call_id = obj
                    .get("tool_call_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                // tool_name is read from the top level first; the nested
                // content.tool_name fallback exists only for records
                // written with tool_name nested under content.
                let tool_name = obj
                    .get("tool_name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| {
                        content
                            .and_then(Value::as_object)
                            .and_then(|c| c.get("tool_name"))
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_default();
                let result = match content {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Message::ToolResult {
                    envelope: Envelope {
                        id,
                        created_at,
                        metadata,
                        extras: Map::new(),
                    },
                    tool_call_id,
                    tool_name,
                    result,
                }
            }
        };

        let mut message = message;
        let extras = message.envelope_mut();
        for (k, v) in obj {
            if !known.contains(k.as_str()) {
                extras.extras.insert(k.clone(), v.clone());
            }
        }

        Ok(message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageDecodeError {
    #[error("wire value is not a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("unknown role '{0}'")]
    UnknownRole(String),
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_wire(&value).map_err(DeError::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(m: Message) -> Message {
        let wire = m.to_wire();
        Message::from_wire(&wire).unwrap()
    }

    #[test]
    fn system_message_roundtrips() {
        let m = Message::system("You are helpful.");
        let r = roundtrip(m.clone());
        assert_eq!(m, r);
    }

    #[test]
    fn tool_result_tool_name_survives_roundtrip_s6() {
        let m = Message::tool_result("id1", "get_weather", "w");
        let wire = m.to_wire();
        assert_eq!(wire["tool_name"], "get_weather");
        assert_eq!(wire["tool_call_id"], "id1");
        let restored = Message::from_wire(&wire).unwrap();
        match restored {
            Message::ToolResult { tool_name, .. } => assert_eq!(tool_name, "get_weather"),
            _ => panic!("expected ToolResult"),
        }
    }

    #[test]
    fn tool_result_falls_back_to_nested_content_tool_name() {
        let legacy = serde_json::json!({
            "role": "tool",
            "message_uuid": "msg_x",
            "message_created": Utc::now().to_rfc3339(),
            "tool_call_id": "id1",
            "content": {"tool_name": "legacy_tool", "result": "w"}
        });
        let restored = Message::from_wire(&legacy).unwrap();
        match restored {
            Message::ToolResult { tool_name, .. } => assert_eq!(tool_name, "legacy_tool"),
            _ => panic!("expected ToolResult"),
        }
    }

    #[test]
    fn thought_signature_survives_roundtrip() {
        let call = ToolCall {
            id: "gemini_call_1".into(),
            tool_name: "get_weather".into(),
            arguments_json: "{}".into(),
            thought_signature: Some("sig-abc".into()),
        };
        let m = Message::tool_calls(vec![call]);
        let r = roundtrip(m.clone());
        assert_eq!(m, r);
    }

    #[test]
    fn unknown_fields_land_in_extras_and_reemit() {
        let mut wire = Message::system("hi").to_wire();
        wire.as_object_mut()
            .unwrap()
            .insert("provider_specific_field".into(), Value::String("keep-me".into()));
        let restored = Message::from_wire(&wire).unwrap();
        let re_emitted = restored.to_wire();
        assert_eq!(re_emitted["provider_specific_field"], "keep-me");
    }

    #[test]
    fn streamed_assistant_roundtrips() {
        let m = Message::StreamedAssistant {
            envelope: Envelope::fresh(),
            buffer: "partial".into(),
            complete: false,
        };
        let r = roundtrip(m.clone());
        assert_eq!(m, r);
    }

    #[test]
    fn user_parts_roundtrip() {
        let m = Message::user_parts(vec![
            ContentPart::Text { text: "look at this".into() },
            ContentPart::ImageUrl { url: "https://example.com/x.png".into() },
        ]);
        let r = roundtrip(m.clone());
        assert_eq!(m, r);
    }

    #[test]
    fn serde_derive_roundtrips_through_json_string() {
        let m = Message::assistant("hi there", Some(TokenUsage::new(3, 5)));
        let s = serde_json::to_string(&m).unwrap();
        let r: Message = serde_json::from_str(&s).unwrap();
        assert_eq!(m, r);
    }
}
