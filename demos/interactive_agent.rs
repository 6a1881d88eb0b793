// Example: interactive multi-turn agent with tool calling and provider
// fallback.
//
// Reads OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY from the
// environment and registers whichever are present as a fallback chain
// (OpenAI first, then Anthropic, then Gemini). Type 'history' to print
// the conversation so far, 'exit' or 'quit' to stop.
//
// Run with: cargo run --example interactive_agent --features "openai anthropic gemini"

use agent_runtime::message::Message;
use agent_runtime::tools::BashTool;
use agent_runtime::{AgentOrchestrator, AgentOrchestratorBuilder, ProviderConfig, RespondOutcome, SessionIdentity, ToolRegistry};
use std::io::{self, Write};
use std::sync::Arc;

fn add_available_providers(mut builder: AgentOrchestratorBuilder) -> AgentOrchestratorBuilder {
    let mut registered = 0;

    #[cfg(feature = "openai")]
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        let driver = Arc::new(agent_runtime::llm::OpenAIDriver::new(key));
        let config = ProviderConfig { model: Some("gpt-4o-mini".into()), ..Default::default() };
        builder = builder.provider("openai", driver, config);
        registered += 1;
    }

    #[cfg(feature = "anthropic")]
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        let driver = Arc::new(agent_runtime::llm::AnthropicDriver::new(key));
        let config = ProviderConfig {
            model: Some("claude-3-5-sonnet-latest".into()),
            max_completion_tokens: Some(1024),
            ..Default::default()
        };
        builder = builder.provider("anthropic", driver, config);
        registered += 1;
    }

    #[cfg(feature = "gemini")]
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        let driver = Arc::new(agent_runtime::llm::GeminiDriver::new(key));
        let config = ProviderConfig { model: Some("gemini-1.5-flash".into()), ..Default::default() };
        builder = builder.provider("gemini", driver, config);
        registered += 1;
    }

    if registered == 0 {
        panic!("set at least one of OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY");
    }

    builder
}

fn print_history(history: &[Message]) {
    for (i, msg) in history.iter().enumerate() {
        match msg {
            Message::System { text, .. } | Message::Developer { text, .. } => {
                println!("  [{}] system: {text}", i + 1);
            }
            Message::User { content, .. } => {
                println!("  [{}] user: {}", i + 1, content.as_text());
            }
            Message::Assistant { text, .. } => {
                println!("  [{}] assistant: {text}", i + 1);
            }
            Message::ToolCall { calls, .. } => {
                for call in calls {
                    println!("  [{}] tool call: {}({})", i + 1, call.tool_name, call.arguments_json);
                }
            }
            Message::ToolResult { tool_name, result, .. } => {
                println!("  [{}] tool result ({tool_name}): {result}", i + 1);
            }
            Message::StreamedAssistant { .. } => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let builder = AgentOrchestrator::builder(SessionIdentity::new("interactive-agent"))
        .tools(ToolRegistry::new().register(BashTool::new().with_timeout(30)))
        .system_prompt("You are a helpful coding assistant with shell access.")
        .max_rounds(8);
    let agent = add_available_providers(builder).build();

    println!("interactive agent ready. type 'exit' to quit, 'history' to inspect the chat log.");

    let mut turn = 0;
    loop {
        turn += 1;
        print!("\n[{turn}] you: ");
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();

        match line {
            "" => continue,
            "exit" | "quit" => break,
            "history" => {
                print_history(&agent.chat_history().await?);
                continue;
            }
            _ => {}
        }

        match agent.respond(Some(line)).await {
            Ok(RespondOutcome::Text(text)) => println!("assistant: {text}"),
            Ok(RespondOutcome::Structured(value)) => println!("assistant (structured): {value}"),
            Ok(RespondOutcome::PendingToolCall(call)) => {
                println!("model requested unregistered tool '{}': stopping", call.tool_name);
                break;
            }
            Err(e) => {
                println!("error: {e}");
                break;
            }
        }
    }

    println!(
        "\nactive provider at end of session: {}",
        agent.last_active_provider().unwrap_or_else(|| "none".into())
    );

    Ok(())
}
