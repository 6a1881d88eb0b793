// Example: multi-turn tool calling via AgentOrchestrator
//
// This demonstrates:
// - Registering the bash tool and letting the orchestrator run the full
//   tool-call loop automatically
// - Inspecting chat history afterwards
//
// Run with: cargo run --example simple_agent --features openai

use agent_runtime::{
    AgentOrchestrator, ProviderConfig, RespondOutcome, SessionIdentity, ToolRegistry,
};
use agent_runtime::llm::OpenAIDriver;
use agent_runtime::tools::BashTool;
use agent_runtime::message::Message;
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

    let agent = AgentOrchestrator::builder(SessionIdentity::new("simple-agent"))
        .provider("openai", driver, config)
        .tools(ToolRegistry::new().register(BashTool::new().with_timeout(30)))
        .system_prompt("You are a helpful coding assistant.")
        .max_rounds(5)
        .build();

    let task = "Please help me with the following tasks:\n\
                1. List all child folders in the current directory\n\
                2. Check the files in the current folder and give me a summary";

    println!("task: {task}\n");

    let outcome = agent.respond(Some(task)).await?;

    match outcome {
        RespondOutcome::Text(text) => println!("{text}"),
        RespondOutcome::Structured(value) => println!("{value}"),
        RespondOutcome::PendingToolCall(call) => {
            println!("model requested an unregistered tool: {}", call.tool_name);
        }
    }

    let history = agent.chat_history().await?;
    println!("\nconversation history ({} messages):", history.len());

    for (i, msg) in history.iter().enumerate() {
        match msg {
            Message::User { content, .. } => {
                println!("  [{}] user: {}", i + 1, content.as_text().lines().next().unwrap_or(""));
            }
            Message::ToolCall { calls, .. } => {
                for tc in calls {
                    println!("  [{}] tool call: {}", i + 1, tc.tool_name);
                }
            }
            Message::Assistant { text, .. } => {
                println!("  [{}] assistant: {}", i + 1, text.lines().next().unwrap_or(""));
            }
            Message::ToolResult { result, .. } => {
                let preview = if result.len() > 100 {
                    format!("{}... ({} chars total)", &result[..100], result.len())
                } else {
                    result.clone()
                };
                println!("  [{}] tool result: {}", i + 1, preview.lines().next().unwrap_or(""));
            }
            Message::System { text, .. } | Message::Developer { text, .. } => {
                println!("  [{}] system: {text}", i + 1);
            }
            Message::StreamedAssistant { .. } => {}
        }
    }

    Ok(())
}
