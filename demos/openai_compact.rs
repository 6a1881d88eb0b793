// Example: shortening a long chat history with the TruncationEngine.
//
// No API key is required — this exercises the drop-oldest strategy
// directly against a hand-built message sequence.
//
// Run with: cargo run --example openai_compact

use agent_runtime::message::Message;
use agent_runtime::{NoopEventBus, TruncationConfig, TruncationEngine, TruncationStrategy};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let history = vec![
        Message::system("You are a helpful assistant."),
        Message::user("What is the capital of France?"),
        Message::assistant(
            "The capital of France is Paris, known for the Eiffel Tower, the \
             Louvre, and Notre-Dame Cathedral.",
            None,
        ),
        Message::user("What about Germany?"),
        Message::assistant(
            "The capital of Germany is Berlin, the country's largest city and \
             a former Cold War flashpoint.",
            None,
        ),
        Message::user("And Italy?"),
        Message::assistant(
            "The capital of Italy is Rome, one of the oldest continuously \
             inhabited cities in the world.",
            None,
        ),
    ];

    println!("original conversation: {} messages", history.len());

    let engine = TruncationEngine::new(
        TruncationConfig {
            // Small enough that the character-based token estimate trips
            // on this sample conversation.
            context_window_size: 40,
            keep_messages: 2,
            preserve_system: true,
            strategy: TruncationStrategy::DropOldest,
        },
        Arc::new(NoopEventBus),
    );

    let identity = agent_runtime::SessionIdentity::new("compact-demo");
    let truncated = engine.truncate(&identity, history).await?;

    println!("truncated conversation: {} messages", truncated.len());
    for (i, msg) in truncated.iter().enumerate() {
        match msg {
            Message::System { text, .. } => println!("  {}. system: {text}", i + 1),
            Message::User { content, .. } => println!("  {}. user: {}", i + 1, content.as_text()),
            Message::Assistant { text, .. } => println!("  {}. assistant: {text}", i + 1),
            _ => {}
        }
    }

    Ok(())
}
