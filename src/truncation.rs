//! TruncationEngine: runs before each provider SEND; shortens the message
//! sequence when the projected prompt would exceed the model's context
//! window.
//!
//! One provider-agnostic pass over the internal `Message` sequence, run
//! once by the orchestrator before formatting for whichever provider is
//! active — rather than duplicating pruning logic per provider.

use crate::error::{AgentError, Result};
use crate::events::{Event, EventBus};
use crate::message::Message;
use crate::session::SessionIdentity;
use async_trait::async_trait;
use std::sync::Arc;

/// ~4 characters per token, with a small fixed per-message overhead —
/// the same heuristic `slb350-open-agent-sdk-rust`'s context module uses,
/// since no provider exposes a local tokenizer we could call instead.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    const CHARS_PER_TOKEN: usize = 4;
    const PER_MESSAGE_OVERHEAD: usize = 4;
    messages
        .iter()
        .map(|m| PER_MESSAGE_OVERHEAD + m.text_for_estimate().len() / CHARS_PER_TOKEN)
        .sum()
}

/// A dedicated sub-agent invoked on the dropped span by the `Summarise`
/// strategy.
#[async_trait]
pub trait ChatSummarizerAgent: Send + Sync {
    async fn summarize(&self, dropped: &[Message]) -> Result<String>;
}

/// A dedicated sub-agent invoked per dropped message by the `Symbolise`
/// strategy; must condense to <=10 words.
#[async_trait]
pub trait ChatSymboliserAgent: Send + Sync {
    async fn symbolise(&self, message: &Message) -> Result<String>;
}

pub enum TruncationStrategy {
    DropOldest,
    Summarise(Arc<dyn ChatSummarizerAgent>),
    Symbolise(Arc<dyn ChatSymboliserAgent>),
}

pub struct TruncationConfig {
    pub context_window_size: usize,
    pub keep_messages: usize,
    pub preserve_system: bool,
    pub strategy: TruncationStrategy,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            context_window_size: 128_000,
            keep_messages: 20,
            preserve_system: true,
            strategy: TruncationStrategy::DropOldest,
        }
    }
}

pub struct TruncationEngine {
    config: TruncationConfig,
    events: Arc<dyn EventBus>,
}

impl TruncationEngine {
    pub fn new(config: TruncationConfig, events: Arc<dyn EventBus>) -> Self {
        Self { config, events }
    }

    fn last_reported_total(messages: &[Message]) -> Option<usize> {
        messages.iter().rev().find_map(|m| match m {
            Message::Assistant { usage: Some(u), .. } => Some(u.total_tokens as usize),
            _ => None,
        })
    }

    fn should_truncate(&self, messages: &[Message]) -> bool {
        let total = Self::last_reported_total(messages)
            .unwrap_or_else(|| estimate_tokens(messages));
        total >= self.config.context_window_size
    }

    /// Split `messages` into a preserved system block, a dropped middle
    /// span, and a preserved tail of `keep_messages` entries. The tail is
    /// always byte-identical to the corresponding input tail.
    fn split(&self, messages: &[Message]) -> (Vec<Message>, Vec<Message>, Vec<Message>) {
        let system_count = if self.config.preserve_system {
            messages
                .iter()
                .take_while(|m| matches!(m, Message::System { .. } | Message::Developer { .. }))
                .count()
        } else {
            0
        };

        let tail_start = messages.len().saturating_sub(self.config.keep_messages);
        let tail_start = tail_start.max(system_count);

        let system_block = messages[..system_count].to_vec();
        let dropped = messages[system_count..tail_start].to_vec();
        let tail = messages[tail_start..].to_vec();
        (system_block, dropped, tail)
    }

    pub async fn truncate(&self, identity: &SessionIdentity, messages: Vec<Message>) -> Result<Vec<Message>> {
        if !self.should_truncate(&messages) {
            return Ok(messages);
        }

        let (system_block, dropped, tail) = self.split(&messages);
        if dropped.is_empty() {
            // Nothing left to drop without touching the preserved tail;
            // idempotent no-op.
            return Ok(messages);
        }

        let mut result = system_block;
        match &self.config.strategy {
            TruncationStrategy::DropOldest => {}
            TruncationStrategy::Summarise(agent) => {
                let summary = agent.summarize(&dropped).await?;
                result.push(Message::system(format!("[summary of earlier conversation] {summary}")));
            }
            TruncationStrategy::Symbolise(agent) => {
                for msg in &dropped {
                    let symbol = agent.symbolise(msg).await?;
                    result.push(Message::system(symbol));
                }
            }
        }
        result.extend(tail);

        self.events.dispatch(Event::ChatHistoryTruncated {
            identity: identity.clone(),
            new_sequence: result.clone(),
        });

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventBus;

    fn make_messages(n: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("You are helpful.")];
        for i in 0..n {
            msgs.push(Message::user(format!("message {i}")));
        }
        msgs
    }

    #[tokio::test]
    async fn drop_oldest_preserves_system_and_tail() {
        let engine = TruncationEngine::new(
            TruncationConfig {
                context_window_size: 1,
                keep_messages: 3,
                preserve_system: true,
                strategy: TruncationStrategy::DropOldest,
            },
            Arc::new(NoopEventBus),
        );
        let identity = SessionIdentity::new("bot");
        let messages = make_messages(20);
        let original_tail = messages[messages.len() - 3..].to_vec();

        let result = engine.truncate(&identity, messages).await.unwrap();
        assert!(matches!(result[0], Message::System { .. }));
        assert_eq!(&result[result.len() - 3..], original_tail.as_slice());
        assert!(result.len() < 21);
    }

    #[tokio::test]
    async fn truncation_is_idempotent() {
        let engine = TruncationEngine::new(
            TruncationConfig {
                context_window_size: 1,
                keep_messages: 3,
                preserve_system: true,
                strategy: TruncationStrategy::DropOldest,
            },
            Arc::new(NoopEventBus),
        );
        let identity = SessionIdentity::new("bot");
        let messages = make_messages(20);
        let once = engine.truncate(&identity, messages).await.unwrap();
        let twice = engine.truncate(&identity, once.clone()).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn below_budget_is_a_no_op() {
        let engine = TruncationEngine::new(
            TruncationConfig {
                context_window_size: 1_000_000,
                keep_messages: 3,
                preserve_system: true,
                strategy: TruncationStrategy::DropOldest,
            },
            Arc::new(NoopEventBus),
        );
        let identity = SessionIdentity::new("bot");
        let messages = make_messages(5);
        let result = engine.truncate(&identity, messages.clone()).await.unwrap();
        assert_eq!(result, messages);
    }

    struct FakeSummarizer;
    #[async_trait::async_trait]
    impl ChatSummarizerAgent for FakeSummarizer {
        async fn summarize(&self, dropped: &[Message]) -> Result<String> {
            Ok(format!("summarised {} messages", dropped.len()))
        }
    }

    #[tokio::test]
    async fn summarise_strategy_inserts_single_synthetic_message() {
        let engine = TruncationEngine::new(
            TruncationConfig {
                context_window_size: 1,
                keep_messages: 3,
                preserve_system: true,
                strategy: TruncationStrategy::Summarise(Arc::new(FakeSummarizer)),
            },
            Arc::new(NoopEventBus),
        );
        let identity = SessionIdentity::new("bot");
        let messages = make_messages(20);
        let result = engine.truncate(&identity, messages).await.unwrap();
        // system + synthetic summary + 3-message tail
        assert_eq!(result.len(), 5);
    }
}
