// Example: basic streamed completion against the OpenAI driver.
//
// Run with: cargo run --example openai_basic --features openai
//
// Set OPENAI_API_KEY before running.

use agent_runtime::llm::OpenAIDriver;
use agent_runtime::message::Message;
use agent_runtime::{AgentOrchestrator, ProviderConfig, SessionIdentity};
use futures::StreamExt;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let api_key =
        std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY environment variable not set");

    let driver = Arc::new(OpenAIDriver::new(api_key));
    let config = ProviderConfig {
        model: Some("gpt-4o-mini".to_string()),
        temperature: Some(1.0),
        ..Default::default()
    };

    let agent = AgentOrchestrator::builder(SessionIdentity::new("openai-basic"))
        .provider("openai", driver, config)
        .system_prompt("You are a helpful assistant.")
        .build();

    let prompt = "Explain what Rust is and why it's popular, in 2-3 sentences.";
    println!("question: {prompt}");

    let mut stream = agent.respond_streamed(Some(prompt));

    while let Some(msg) = stream.next().await {
        match msg? {
            // Incremental deltas arrive with `complete = false`; the final
            // chunk carries the full text with `complete = true`, so it's
            // only used here to know when to stop printing.
            Message::StreamedAssistant { buffer, complete: false, .. } => print!("{buffer}"),
            Message::StreamedAssistant { complete: true, .. } => println!(),
            _ => {}
        }
    }

    let history = agent.chat_history().await?;
    println!("history length: {}", history.len());
    if let Some(Message::Assistant { usage: Some(usage), .. }) = history.last() {
        println!(
            "usage: prompt={} completion={} total={}",
            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
        );
    }

    Ok(())
}
