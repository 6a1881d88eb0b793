//! Provider-agnostic LLM agent runtime: a chat orchestration loop that
//! talks to OpenAI, Anthropic, and Gemini through a common wire-agnostic
//! message model, with pluggable history storage, schema-driven tool
//! calling, context truncation, and usage accounting.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod llm;
pub mod message;
pub mod schema;
pub mod session;
pub mod tools;
pub mod truncation;
pub mod usage;

pub use agent::{AgentHooks, AgentOrchestrator, AgentOrchestratorBuilder, NoopHooks, RespondOutcome};
pub use config::{ProviderConfig, RuntimeConfig, StorageChainConfig};
pub use error::{AgentError, Result};
pub use events::{Event, EventBus, LoggingEventBus, NoopEventBus};
pub use history::{HistoryDriver, HistoryStore};
pub use message::{Envelope, Message, Role, TokenUsage, ToolCall};
pub use schema::{
    coerce, json_schema_for, schema_for, CoerceError, DataModelArray, DataModelArrayDescriptor,
    DataModelDescriptor, FieldSchema, ScalarKind, TypeDescriptor,
};
pub use session::SessionIdentity;
pub use tools::{DataModelTool, InvokeOutcome, Tool, ToolProvider, ToolRegistry};
pub use truncation::{TruncationConfig, TruncationEngine, TruncationStrategy};
pub use usage::{UsageFilter, UsageLedger, UsageRecord};
