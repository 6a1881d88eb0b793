// Example: loop detection terminating a runaway tool-calling turn.
//
// Registers the bash tool with an aggressive `LoopDetectorConfig` so a
// model that keeps re-issuing the same command gets cut off well before
// the orchestrator's hard `max_rounds` limit.
//
// Run with: cargo run --example loop_detection_demo --features openai

use agent_runtime::llm::{LoopDetector, LoopDetectorConfig, OpenAIDriver};
use agent_runtime::tools::BashTool;
use agent_runtime::{AgentOrchestrator, ProviderConfig, RespondOutcome, SessionIdentity, ToolRegistry};
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

    let loop_config = LoopDetectorConfig {
        max_exact_duplicates: 2,
        ..Default::default()
    };

    let agent = AgentOrchestrator::builder(SessionIdentity::new("loop-detection-demo"))
        .provider("openai", driver, config)
        .tools(ToolRegistry::new().register(BashTool::new().with_timeout(10)))
        .system_prompt("You are a shell assistant.")
        .loop_detector(LoopDetector::with_config(loop_config))
        .max_rounds(20)
        .build();

    let prompt = "Please check the current directory repeatedly, even if you \
                  already know what's there.";
    println!("user: {prompt}");

    match agent.respond(Some(prompt)).await {
        Ok(RespondOutcome::Text(text)) => println!("assistant: {text}"),
        Ok(other) => println!("assistant (other outcome): {other:?}"),
        Err(e) => println!(
            "terminated: {e}\n(expected once loop detection fires on repeated calls)"
        ),
    }

    let history = agent.chat_history().await?;
    println!("messages recorded before termination: {}", history.len());

    Ok(())
}
