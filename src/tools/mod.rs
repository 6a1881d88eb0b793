//! ToolRegistry + ToolInvoker: declarative tool registration and the
//! execution path that validates model-supplied arguments, coerces them,
//! runs the callback, and wraps the result as a `ToolResultMessage`.

pub mod bash;

pub use bash::BashTool;

use crate::error::AgentError;
use crate::message::{Message, ToolCall};
use crate::schema::{coerce, schema_for, CoerceError, DataModelDescriptor, TypeDescriptor};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

/// A named, JSON-schema-typed function the model may call during a turn.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Full usage details; `ToolRegistry::get_tools_for_llm` sends this as
    /// the tool's description.
    fn full_description(&self) -> String;

    /// JSON-Schema for the tool's parameters.
    fn parameters(&self) -> Value;

    /// Optional `TypeDescriptor` used to coerce arguments before `execute`
    /// is invoked. `None` means arguments are passed through unvalidated
    /// (the callback is responsible for checking them itself).
    fn argument_schema(&self) -> Option<TypeDescriptor> {
        None
    }

    async fn execute(&self, call: &ToolCall) -> std::result::Result<String, String>;
}

/// Wire-level declaration sent to a provider driver's `format()`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub required: Vec<String>,
}

type DataModelCallback = Arc<
    dyn Fn(Value) -> Pin<Box<dyn std::future::Future<Output = std::result::Result<String, String>> + Send>>
        + Send
        + Sync,
>;

/// A declaratively-built tool whose parameter schema is a single
/// `DataModelDescriptor` (the "Root DataModel tool" registration form): the
/// invoker coerces the model-supplied arguments against `model` before the
/// callback ever runs, so the callback always receives a validated object.
/// A field of `model` whose own type is `TypeDescriptor::DataModel(..)` is
/// the "DataModel-valued property" form — coerced recursively, no special
/// casing needed beyond `schema::coerce`'s existing nesting.
pub struct DataModelTool {
    name: String,
    description: String,
    model: DataModelDescriptor,
    callback: DataModelCallback,
}

impl DataModelTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        model: DataModelDescriptor,
        callback: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<String, String>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            model,
            callback: Arc::new(move |args| Box::pin(callback(args))),
        }
    }
}

#[async_trait]
impl ToolProvider for DataModelTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn full_description(&self) -> String {
        self.description.clone()
    }

    fn parameters(&self) -> Value {
        schema_for(&TypeDescriptor::DataModel(self.model.clone()))
    }

    fn argument_schema(&self) -> Option<TypeDescriptor> {
        Some(TypeDescriptor::DataModel(self.model.clone()))
    }

    async fn execute(&self, call: &ToolCall) -> std::result::Result<String, String> {
        let args = call
            .arguments()
            .map_err(|e| format!("arguments are not valid JSON: {e}"))?;
        (self.callback)(args).await
    }
}

enum RegisteredTool {
    Local(Arc<dyn ToolProvider>),
    /// A declared tool with no local callback. The orchestrator surfaces
    /// its invocation to the caller instead of executing it.
    Phantom { name: String, description: String, parameters: Value },
}

impl RegisteredTool {
    fn as_wire_tool(&self) -> Tool {
        match self {
            RegisteredTool::Local(provider) => Tool {
                name: provider.name().to_string(),
                description: provider.full_description(),
                parameters: provider.parameters(),
                required: required_fields(&provider.parameters()),
            },
            RegisteredTool::Phantom { name, description, parameters } => Tool {
                name: name.clone(),
                description: description.clone(),
                parameters: parameters.clone(),
                required: required_fields(parameters),
            },
        }
    }
}

fn required_fields(parameters: &Value) -> Vec<String> {
    parameters
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// The outcome of invoking a single tool call.
pub enum InvokeOutcome {
    /// The tool ran (successfully or not); a `ToolResultMessage` is ready
    /// to append and the loop should continue.
    Result(Message),
    /// The tool has no local callback; the caller must execute it
    /// externally and supply a `ToolResultMessage` on the next turn.
    Phantom(ToolCall),
}

/// Registered tools (declarative schema + callback) plus the execution
/// path. Invariant: every tool name appears at most once (`register`
/// overwrites silently, matching a `HashMap`'s natural behaviour, since a
/// caller re-registering the same name is assumed to mean "replace").
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Arc<std::sync::RwLock<HashMap<String, Arc<RegisteredTool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ToolProvider + 'static>(self, tool: T) -> Self {
        let name = tool.name().to_string();
        self.tools
            .write()
            .unwrap()
            .insert(name, Arc::new(RegisteredTool::Local(Arc::new(tool))));
        self
    }

    /// Register a phantom tool: the model may call it, but there is no
    /// local callback. See `InvokeOutcome::Phantom`.
    pub fn register_phantom(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        let name = name.into();
        self.tools.write().unwrap().insert(
            name.clone(),
            Arc::new(RegisteredTool::Phantom {
                name,
                description: description.into(),
                parameters,
            }),
        );
        self
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().unwrap().contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.read().unwrap().keys().cloned().collect()
    }

    /// Tool declarations to forward to a provider driver's `format()`.
    pub fn get_tools_for_llm(&self) -> Vec<Tool> {
        self.tools
            .read()
            .unwrap()
            .values()
            .map(|t| t.as_wire_tool())
            .collect()
    }

    /// Execute (or surface, for phantom tools) a single tool call,
    /// validating/coercing arguments first. An unregistered tool produces a
    /// recovered `ToolResultMessage` rather than a fatal error, keeping the
    /// conversation going.
    pub async fn invoke(&self, call: &ToolCall) -> InvokeOutcome {
        let tool = self.tools.read().unwrap().get(&call.tool_name).cloned();

        let Some(tool) = tool else {
            return InvokeOutcome::Result(Message::tool_result(
                call.id.clone(),
                call.tool_name.clone(),
                format!("tool '{}' is not registered", call.tool_name),
            ));
        };

        let provider = match tool.as_ref() {
            RegisteredTool::Phantom { .. } => return InvokeOutcome::Phantom(call.clone()),
            RegisteredTool::Local(provider) => provider.clone(),
        };

        let coerced = match validate_arguments(call, provider.as_ref()) {
            Ok(coerced) => coerced,
            Err(e) => {
                return InvokeOutcome::Result(Message::tool_result(
                    call.id.clone(),
                    call.tool_name.clone(),
                    format!("invalid arguments: {e}"),
                ));
            }
        };

        let effective_call = match coerced {
            Some(value) => ToolCall {
                arguments_json: value.to_string(),
                ..call.clone()
            },
            None => call.clone(),
        };

        match provider.execute(&effective_call).await {
            Ok(output) => {
                InvokeOutcome::Result(Message::tool_result(call.id.clone(), call.tool_name.clone(), output))
            }
            Err(error) => {
                InvokeOutcome::Result(Message::tool_result(call.id.clone(), call.tool_name.clone(), error))
            }
        }
    }
}

/// Coerces `call`'s arguments against `provider`'s declared schema, if any.
/// Returns the coerced value so the caller can substitute it in place of
/// the model's raw JSON before invoking the tool's callback; `None` means
/// the provider declared no schema and arguments pass through unvalidated.
fn validate_arguments(
    call: &ToolCall,
    provider: &dyn ToolProvider,
) -> std::result::Result<Option<Value>, AgentError> {
    let Some(schema) = provider.argument_schema() else {
        return Ok(None);
    };
    let args: Value = call
        .arguments()
        .map_err(|e| AgentError::ToolValidation {
            tool: call.tool_name.clone(),
            message: format!("arguments are not valid JSON: {e}"),
        })?;
    let coerced = coerce(&args, &schema).map_err(|e: CoerceError| AgentError::ToolValidation {
        tool: call.tool_name.clone(),
        message: e.to_string(),
    })?;
    Ok(Some(coerced))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;
    #[async_trait]
    impl ToolProvider for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn full_description(&self) -> String {
            "echoes its input back".into()
        }
        fn parameters(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
            })
        }
        async fn execute(&self, call: &ToolCall) -> std::result::Result<String, String> {
            let args = call.arguments().map_err(|e| e.to_string())?;
            Ok(args["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            tool_name: name.into(),
            arguments_json: args.into(),
            thought_signature: None,
        }
    }

    #[tokio::test]
    async fn registered_tool_executes_and_wraps_result() {
        let registry = ToolRegistry::new().register(EchoTool);
        let outcome = registry.invoke(&call("echo", r#"{"text":"hi"}"#)).await;
        match outcome {
            InvokeOutcome::Result(Message::ToolResult { result, tool_name, .. }) => {
                assert_eq!(result, "hi");
                assert_eq!(tool_name, "echo");
            }
            _ => panic!("expected ToolResult"),
        }
    }

    #[tokio::test]
    async fn unregistered_tool_is_recovered_as_tool_result() {
        let registry = ToolRegistry::new();
        let outcome = registry.invoke(&call("missing", "{}")).await;
        match outcome {
            InvokeOutcome::Result(Message::ToolResult { result, .. }) => {
                assert!(result.contains("not registered"));
            }
            _ => panic!("expected ToolResult"),
        }
    }

    #[tokio::test]
    async fn phantom_tool_surfaces_the_call_instead_of_executing() {
        let registry = ToolRegistry::new().register_phantom(
            "approve_refund",
            "Ask a human to approve a refund",
            serde_json::json!({"type":"object","properties":{}}),
        );
        let outcome = registry.invoke(&call("approve_refund", "{}")).await;
        assert!(matches!(outcome, InvokeOutcome::Phantom(_)));
    }

    #[test]
    fn get_tools_for_llm_reflects_full_description() {
        let registry = ToolRegistry::new().register(EchoTool);
        let tools = registry.get_tools_for_llm();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].required, vec!["text"]);
    }

    fn make_order_tool() -> DataModelTool {
        use crate::schema::{FieldSchema, ScalarKind};

        let shipping_address = DataModelDescriptor::new(
            "Address",
            vec![
                FieldSchema::new("city", TypeDescriptor::Scalar(ScalarKind::String)),
                FieldSchema::new("zip", TypeDescriptor::Scalar(ScalarKind::String)),
            ],
        );
        let order = DataModelDescriptor::new(
            "Order",
            vec![
                FieldSchema::new("sku", TypeDescriptor::Scalar(ScalarKind::String)),
                FieldSchema::new("quantity", TypeDescriptor::Scalar(ScalarKind::Int)),
                FieldSchema::new("address", TypeDescriptor::DataModel(shipping_address)),
            ],
        );
        DataModelTool::new("place_order", "Places an order", order, |args| async move {
            Ok(args.to_string())
        })
    }

    #[test]
    fn root_data_model_tool_advertises_its_model_as_the_full_schema() {
        let tool = make_order_tool();
        let params = tool.parameters();
        assert_eq!(params["type"], "object");
        assert!(params["properties"]["address"]["properties"]["city"].is_object());
        assert!(tool.argument_schema().is_some());
    }

    #[tokio::test]
    async fn invoke_passes_the_coerced_value_not_the_raw_arguments() {
        let registry = ToolRegistry::new().register(make_order_tool());
        // Extra field `gift_wrap` should be coerced away into `extras`, and
        // the nested `address` DataModel must survive the round trip too.
        let raw = serde_json::json!({
            "sku": "sku-1",
            "quantity": 2,
            "address": {"city": "Springfield", "zip": "00000"},
            "gift_wrap": true,
        });
        let outcome = registry
            .invoke(&call("place_order", &raw.to_string()))
            .await;
        match outcome {
            InvokeOutcome::Result(Message::ToolResult { result, .. }) => {
                let echoed: Value = serde_json::from_str(&result).unwrap();
                assert_eq!(echoed["sku"], "sku-1");
                assert_eq!(echoed["address"]["city"], "Springfield");
                assert_eq!(echoed["extras"]["gift_wrap"], true);
            }
            _ => panic!("expected ToolResult"),
        }
    }

    #[tokio::test]
    async fn invalid_arguments_against_a_declared_schema_are_rejected() {
        let registry = ToolRegistry::new().register(make_order_tool());
        let bad = serde_json::json!({"sku": "sku-1", "quantity": "two"});
        let outcome = registry.invoke(&call("place_order", &bad.to_string())).await;
        match outcome {
            InvokeOutcome::Result(Message::ToolResult { result, .. }) => {
                assert!(result.contains("invalid arguments"));
            }
            _ => panic!("expected ToolResult"),
        }
    }
}
