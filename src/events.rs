//! Fire-and-forget event bus (`dispatch(event)`), with a no-op default so
//! standalone usage never requires a host framework to be present — the
//! logger facade is injected the same way, rather than reached for as a
//! global singleton.

use crate::message::Message;
use crate::session::SessionIdentity;

#[derive(Debug, Clone)]
pub enum Event {
    /// Emitted by the TruncationEngine after an atomic history replacement.
    ChatHistoryTruncated {
        identity: SessionIdentity,
        new_sequence: Vec<Message>,
    },
    /// Emitted by the orchestrator immediately before a fatal error
    /// propagates to the caller.
    EngineError { message: String },
}

pub trait EventBus: Send + Sync {
    fn dispatch(&self, event: Event);
}

pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn dispatch(&self, _event: Event) {}
}

/// Logs every event at `debug` via the `log` facade; a reasonable default
/// for hosts that want visibility without wiring a real bus.
pub struct LoggingEventBus;

impl EventBus for LoggingEventBus {
    fn dispatch(&self, event: Event) {
        match event {
            Event::ChatHistoryTruncated { identity, new_sequence } => {
                log::debug!(
                    "history truncated for {}: {} messages remain",
                    identity.key(),
                    new_sequence.len()
                );
            }
            Event::EngineError { message } => {
                log::error!("engine error: {message}");
            }
        }
    }
}
