// Example: a phantom tool — declared to the model but executed by the
// caller rather than the orchestrator.
//
// Run with: cargo run --example openai_tools --features openai
//
// Set OPENAI_API_KEY before running.

use agent_runtime::llm::OpenAIDriver;
use agent_runtime::{AgentOrchestrator, Message, ProviderConfig, RespondOutcome, SessionIdentity, ToolRegistry};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let api_key =
        std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY environment variable not set");

    let driver = Arc::new(OpenAIDriver::new(api_key));
    let config = ProviderConfig {
        model: Some("gpt-4o-mini".to_string()),
        ..Default::default()
    };

    let tools = ToolRegistry::new().register_phantom(
        "get_weather",
        "Get the current weather for a location",
        json!({
            "type": "object",
            "properties": {
                "location": { "type": "string", "description": "City and country" },
                "unit": { "type": "string", "enum": ["celsius", "fahrenheit"] }
            },
            "required": ["location"]
        }),
    );

    let agent = AgentOrchestrator::builder(SessionIdentity::new("openai-tools"))
        .provider("openai", driver, config)
        .tools(tools)
        .system_prompt("You are a helpful assistant with access to a weather lookup tool.")
        .build();

    let prompt = "What's the weather like in San Francisco?";
    println!("user: {prompt}");

    match agent.respond(Some(prompt)).await? {
        RespondOutcome::PendingToolCall(call) => {
            println!("model requested tool '{}' with args {}", call.tool_name, call.arguments_json);

            // The caller is responsible for executing phantom tools; here
            // we just fabricate a result instead of calling a real API.
            let result = Message::tool_result(
                call.id.clone(),
                call.tool_name.clone(),
                "San Francisco is 61F and foggy.",
            );
            agent.add_message(result).await?;

            match agent.respond(None).await? {
                RespondOutcome::Text(text) => println!("assistant: {text}"),
                other => println!("unexpected outcome: {other:?}"),
            }
        }
        RespondOutcome::Text(text) => println!("assistant (no tool call): {text}"),
        RespondOutcome::Structured(value) => println!("assistant (structured): {value}"),
    }

    Ok(())
}
