//! AgentOrchestrator: the top-level `respond`/`respond_streamed` loop.
//!
//! One provider-agnostic loop driven entirely through the `ProviderDriver`
//! contract, with a full lifecycle-hook set and a per-call (not per-agent)
//! provider-fallback cursor so concurrent `respond()` calls on the same
//! orchestrator never race on "which provider is active" — see
//! `FallbackCursor` below.

use crate::config::ProviderConfig;
use crate::error::{AgentError, Result};
use crate::events::{Event, EventBus, NoopEventBus};
use crate::history::HistoryStore;
use crate::llm::loop_detector::{LoopAction, LoopDetector};
use crate::llm::provider::{
    FinishReason, FormatOptions, NormalizedChunk, NormalizedResponse, ProviderDriver,
};
use crate::message::{Message, ToolCall};
use crate::schema::{coerce, CoerceError, TypeDescriptor};
use crate::session::SessionIdentity;
use crate::tools::{InvokeOutcome, ToolRegistry};
use crate::usage::UsageLedger;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::Mutex as AsyncMutex;

/// Lifecycle hooks fired at the points named in the orchestrator's
/// behavioural contract. All methods default to no-ops so a host only
/// overrides the ones it cares about.
#[async_trait]
pub trait AgentHooks: Send + Sync {
    async fn before_send(&self, _messages: &[Message]) {}
    async fn before_response(&self, _messages: &[Message]) {}
    async fn after_response(&self, _response: &NormalizedResponse) {}
    async fn before_tool_execution(&self, _call: &ToolCall) {}
    async fn after_tool_execution(&self, _call: &ToolCall, _result: &Message) {}
    async fn before_structured_output(&self, _raw: &Value) {}
    async fn after_send(&self, _final_message: &Message) {}
    async fn on_engine_error(&self, _error: &AgentError) {}
}

/// The lifecycle hook set used when a host registers none of its own.
pub struct NoopHooks;
impl AgentHooks for NoopHooks {}

/// The result of a completed `respond()` call.
#[derive(Debug, Clone)]
pub enum RespondOutcome {
    /// Plain assistant text.
    Text(String),
    /// Assistant content parsed and coerced against a declared structured
    /// output schema.
    Structured(Value),
    /// A phantom tool was called; the caller must execute it externally
    /// and supply a `ToolResultMessage` on the next `respond()`.
    PendingToolCall(ToolCall),
}

/// One entry in the agent's ordered fallback sequence.
struct ProviderEntry {
    name: String,
    driver: Arc<dyn ProviderDriver>,
    config: ProviderConfig,
}

/// Per-call cursor into the provider fallback sequence.
///
/// Deliberately *not* a field on `AgentOrchestrator`. Keeping it local to
/// one `respond()` invocation means two concurrent calls against the same
/// orchestrator never share — and therefore never race on — "which
/// provider is active right now". `AgentOrchestrator::last_active_provider`
/// below is a separate, best-effort diagnostic value; it plays no part in
/// fallback decisions.
struct FallbackCursor<'a> {
    providers: &'a [ProviderEntry],
    index: usize,
}

impl<'a> FallbackCursor<'a> {
    fn new(providers: &'a [ProviderEntry]) -> Result<Self> {
        if providers.is_empty() {
            return Err(AgentError::Config("no providers configured".into()));
        }
        Ok(Self { providers, index: 0 })
    }

    fn current(&self) -> &'a ProviderEntry {
        &self.providers[self.index]
    }

    /// Advance to the next provider. Returns `false` when the sequence is
    /// exhausted.
    fn advance(&mut self) -> bool {
        if self.index + 1 < self.providers.len() {
            self.index += 1;
            true
        } else {
            false
        }
    }
}

/// Structured-output declaration: the JSON-Schema forwarded to the
/// provider plus the `TypeDescriptor` used to coerce the parsed response.
struct StructuredOutput {
    schema: Value,
    descriptor: TypeDescriptor,
}

pub struct AgentOrchestrator {
    identity: SessionIdentity,
    providers: Vec<ProviderEntry>,
    agent_model: Option<String>,
    tools: ToolRegistry,
    history: Arc<HistoryStore>,
    truncation: Option<Arc<crate::truncation::TruncationEngine>>,
    events: Arc<dyn EventBus>,
    usage: Arc<UsageLedger>,
    hooks: Arc<dyn AgentHooks>,
    system_prompt: Option<String>,
    reinject_system: bool,
    max_rounds: usize,
    structured_output: Option<StructuredOutput>,
    loop_detector: Option<AsyncMutex<LoopDetector>>,
    session_locks: StdRwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
    last_active_provider: StdRwLock<Option<String>>,
}

impl AgentOrchestrator {
    pub fn builder(identity: SessionIdentity) -> AgentOrchestratorBuilder {
        AgentOrchestratorBuilder::new(identity)
    }

    fn session_lock(&self) -> Arc<AsyncMutex<()>> {
        let key = self.identity.key();
        if let Some(lock) = self.session_locks.read().unwrap().get(&key) {
            return lock.clone();
        }
        self.session_locks
            .write()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn add_message(&self, msg: Message) -> Result<()> {
        self.history
            .append(&self.identity, msg)
            .await
            .map_err(AgentError::Config)
    }

    pub async fn last_message(&self) -> Result<Option<Message>> {
        self.history.last(&self.identity).await.map_err(AgentError::Config)
    }

    pub async fn chat_history(&self) -> Result<Vec<Message>> {
        self.history.load(&self.identity).await.map_err(AgentError::Config)
    }

    pub async fn clear(&self) -> Result<()> {
        self.history.clear(&self.identity).await.map_err(AgentError::Config)
    }

    /// The provider name used to complete the most recent call, if any.
    /// Diagnostic only — see `FallbackCursor`.
    pub fn last_active_provider(&self) -> Option<String> {
        self.last_active_provider.read().unwrap().clone()
    }

    fn effective_config(&self, entry: &ProviderEntry) -> ProviderConfig {
        let mut config = entry.config.clone();
        if config.model.is_none() {
            config.model = self.agent_model.clone();
        }
        config
    }

    /// Load this session's history and, if a system prompt is configured,
    /// seed it in. The first time a system message is inserted it is also
    /// persisted to the `HistoryStore` (not just the local working copy),
    /// so `chat_history()` reflects it after the call returns. A
    /// `reinject_system` refresh, by contrast, only ever touches the
    /// working copy sent to the provider for this turn — the stored
    /// system message from the first turn is left alone.
    async fn seed_messages(&self) -> Result<Vec<Message>> {
        let mut loaded = self.history.load(&self.identity).await.map_err(AgentError::Config)?;
        let has_system = loaded
            .iter()
            .any(|m| matches!(m, Message::System { .. } | Message::Developer { .. }));
        if let Some(prompt) = &self.system_prompt {
            if !has_system {
                let system_msg = Message::system(prompt.clone());
                loaded.insert(0, system_msg.clone());
                self.history
                    .append(&self.identity, system_msg)
                    .await
                    .map_err(AgentError::Config)?;
            } else if self.reinject_system {
                loaded.retain(|m| !matches!(m, Message::System { .. }));
                loaded.insert(0, Message::system(prompt.clone()));
            }
        }
        Ok(loaded)
    }

    /// Run the full tool-calling loop to completion and return the final
    /// outcome. Shared by `respond()`; `respond_streamed()` has its own
    /// variant so it can yield intermediate messages as they are produced.
    pub async fn respond(&self, user_prompt: Option<&str>) -> Result<RespondOutcome> {
        let _guard = self.session_lock().lock_owned().await;

        let mut messages = self.seed_messages().await?;

        if let Some(prompt) = user_prompt {
            let user_msg = Message::user(prompt);
            messages.push(user_msg.clone());
            self.history
                .append(&self.identity, user_msg)
                .await
                .map_err(AgentError::Config)?;
        }

        let mut cursor = FallbackCursor::new(&self.providers)?;
        let mut rounds = 0usize;

        loop {
            self.hooks.before_send(&messages).await;

            if let Some(engine) = &self.truncation {
                messages = engine
                    .truncate(&self.identity, messages)
                    .await?;
                self.history
                    .replace(&self.identity, messages.clone())
                    .await
                    .map_err(AgentError::Config)?;
            }

            self.hooks.before_response(&messages).await;

            let response = match self.send_with_fallback(&mut cursor, &messages).await {
                Ok(r) => r,
                Err(e) => {
                    self.hooks.on_engine_error(&e).await;
                    self.events.dispatch(Event::EngineError {
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            };

            self.hooks.after_response(&response).await;
            self.last_active_provider
                .write()
                .unwrap()
                .replace(cursor.current().name.clone());

            match response {
                NormalizedResponse::Content {
                    text,
                    usage,
                    finish_reason,
                } => {
                    if let Some(usage) = usage {
                        self.usage.record(
                            self.identity.agent_name.clone(),
                            self.effective_config(cursor.current()).model.unwrap_or_default(),
                            cursor.current().name.clone(),
                            self.identity.user_id.clone(),
                            usage,
                        );
                    }

                    let outcome = if let Some(structured) = &self.structured_output {
                        self.hooks.before_structured_output(&Value::String(text.clone())).await;
                        let parsed = crate::llm::provider::parse_structured_output(&text)?;
                        let coerced = coerce(&parsed, &structured.descriptor)
                            .map_err(|e: CoerceError| AgentError::StructuredOutputParse {
                                message: e.to_string(),
                                raw: text.clone(),
                            })?;
                        RespondOutcome::Structured(coerced)
                    } else {
                        RespondOutcome::Text(text.clone())
                    };

                    let assistant_msg = Message::assistant(text, usage);
                    self.history
                        .append(&self.identity, assistant_msg.clone())
                        .await
                        .map_err(AgentError::Config)?;
                    self.hooks.after_send(&assistant_msg).await;
                    let _ = finish_reason;
                    return Ok(outcome);
                }
                NormalizedResponse::ToolCalls {
                    calls,
                    usage,
                    finish_reason: _,
                } => {
                    if let Some(usage) = usage {
                        self.usage.record(
                            self.identity.agent_name.clone(),
                            self.effective_config(cursor.current()).model.unwrap_or_default(),
                            cursor.current().name.clone(),
                            self.identity.user_id.clone(),
                            usage,
                        );
                    }

                    let call_msg = Message::tool_calls(calls.clone());
                    messages.push(call_msg.clone());
                    self.history
                        .append(&self.identity, call_msg)
                        .await
                        .map_err(AgentError::Config)?;

                    for call in &calls {
                        if let Some(detector) = &self.loop_detector {
                            let mut detector = detector.lock().await;
                            if let Some(detection) = detector.check(call) {
                                if detection.action == LoopAction::Terminate {
                                    return Err(AgentError::LoopLimit {
                                        rounds,
                                        limit: self.max_rounds,
                                    });
                                }
                                if let Some(warning) = detection.warning_message {
                                    let warn_msg = Message::system(warning);
                                    messages.push(warn_msg.clone());
                                    self.history
                                        .append(&self.identity, warn_msg)
                                        .await
                                        .map_err(AgentError::Config)?;
                                }
                            }
                        }

                        self.hooks.before_tool_execution(call).await;
                        match self.tools.invoke(call).await {
                            InvokeOutcome::Phantom(pending) => return Ok(RespondOutcome::PendingToolCall(pending)),
                            InvokeOutcome::Result(result_msg) => {
                                self.hooks.after_tool_execution(call, &result_msg).await;
                                messages.push(result_msg.clone());
                                self.history
                                    .append(&self.identity, result_msg)
                                    .await
                                    .map_err(AgentError::Config)?;
                            }
                        }
                    }

                    rounds += 1;
                    if rounds > self.max_rounds {
                        return Err(AgentError::LoopLimit {
                            rounds,
                            limit: self.max_rounds,
                        });
                    }
                }
            }
        }
    }

    /// Send `messages` to the currently active provider, advancing the
    /// fallback cursor on a retryable error until one succeeds or the
    /// sequence is exhausted.
    async fn send_with_fallback(
        &self,
        cursor: &mut FallbackCursor<'_>,
        messages: &[Message],
    ) -> Result<NormalizedResponse> {
        let schema_value = self.structured_output.as_ref().map(|s| &s.schema);
        loop {
            let entry = cursor.current();
            let config = self.effective_config(entry);
            let tools = self.tools.get_tools_for_llm();
            let options = FormatOptions { schema: schema_value };
            let payload = entry.driver.format(messages, &tools, &options, &config);

            match entry.driver.send(payload, &config).await {
                Ok(response) => return Ok(response),
                Err(e) if e.triggers_fallback() => {
                    if !cursor.advance() {
                        return Err(AgentError::AllProvidersFailed(Box::new(e)));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream a response, yielding incremental assistant chunks followed by
    /// intermediate tool-call/tool-result messages, matching the ordering
    /// `respond()` produces. The final content chunk carries `complete =
    /// true`.
    pub fn respond_streamed<'a>(
        &'a self,
        user_prompt: Option<&'a str>,
    ) -> Pin<Box<dyn Stream<Item = Result<Message>> + Send + 'a>> {
        Box::pin(try_stream! {
            let _guard = self.session_lock().lock_owned().await;

            let mut messages = self.seed_messages().await?;

            if let Some(prompt) = user_prompt {
                let user_msg = Message::user(prompt);
                messages.push(user_msg.clone());
                self.history.append(&self.identity, user_msg).await.map_err(AgentError::Config)?;
            }

            let mut cursor = FallbackCursor::new(&self.providers)?;
            let mut rounds = 0usize;

            loop {
                self.hooks.before_send(&messages).await;

                if let Some(engine) = &self.truncation {
                    messages = engine.truncate(&self.identity, messages).await?;
                    self.history
                        .replace(&self.identity, messages.clone())
                        .await
                        .map_err(AgentError::Config)?;
                }

                self.hooks.before_response(&messages).await;

                let (final_response, chunks) = self.stream_with_fallback(&mut cursor, &messages).await?;

                for text in chunks {
                    yield Message::StreamedAssistant {
                        envelope: Default::default(),
                        buffer: text,
                        complete: false,
                    };
                }

                self.hooks.after_response(&final_response).await;
                self.last_active_provider.write().unwrap().replace(cursor.current().name.clone());

                match final_response {
                    NormalizedResponse::Content { text, usage, .. } => {
                        if let Some(usage) = usage {
                            self.usage.record(
                                self.identity.agent_name.clone(),
                                self.effective_config(cursor.current()).model.unwrap_or_default(),
                                cursor.current().name.clone(),
                                self.identity.user_id.clone(),
                                usage,
                            );
                        }
                        let assistant_msg = Message::assistant(text, usage);
                        self.history.append(&self.identity, assistant_msg.clone()).await.map_err(AgentError::Config)?;
                        self.hooks.after_send(&assistant_msg).await;
                        yield Message::StreamedAssistant {
                            envelope: Default::default(),
                            buffer: assistant_msg.text_for_estimate(),
                            complete: true,
                        };
                        return;
                    }
                    NormalizedResponse::ToolCalls { calls, usage, .. } => {
                        if let Some(usage) = usage {
                            self.usage.record(
                                self.identity.agent_name.clone(),
                                self.effective_config(cursor.current()).model.unwrap_or_default(),
                                cursor.current().name.clone(),
                                self.identity.user_id.clone(),
                                usage,
                            );
                        }

                        let call_msg = Message::tool_calls(calls.clone());
                        messages.push(call_msg.clone());
                        self.history.append(&self.identity, call_msg.clone()).await.map_err(AgentError::Config)?;
                        yield call_msg;

                        for call in &calls {
                            if let Some(detector) = &self.loop_detector {
                                let mut detector = detector.lock().await;
                                if let Some(detection) = detector.check(call) {
                                    if detection.action == LoopAction::Terminate {
                                        Err(AgentError::LoopLimit { rounds, limit: self.max_rounds })?;
                                    }
                                    if let Some(warning) = detection.warning_message {
                                        let warn_msg = Message::system(warning);
                                        messages.push(warn_msg.clone());
                                        self.history.append(&self.identity, warn_msg).await.map_err(AgentError::Config)?;
                                    }
                                }
                            }

                            self.hooks.before_tool_execution(call).await;
                            match self.tools.invoke(call).await {
                                InvokeOutcome::Phantom(pending) => {
                                    yield Message::tool_calls(vec![pending]);
                                    return;
                                }
                                InvokeOutcome::Result(result_msg) => {
                                    self.hooks.after_tool_execution(call, &result_msg).await;
                                    messages.push(result_msg.clone());
                                    self.history.append(&self.identity, result_msg.clone()).await.map_err(AgentError::Config)?;
                                    yield result_msg;
                                }
                            }
                        }

                        rounds += 1;
                        if rounds > self.max_rounds {
                            Err(AgentError::LoopLimit { rounds, limit: self.max_rounds })?;
                        }
                    }
                }
            }
        })
    }

    /// Like `send_with_fallback`, but drives the streamed path and
    /// collects content deltas alongside the terminal `NormalizedResponse`.
    async fn stream_with_fallback(
        &self,
        cursor: &mut FallbackCursor<'_>,
        messages: &[Message],
    ) -> Result<(NormalizedResponse, Vec<String>)> {
        use futures::StreamExt;

        let schema_value = self.structured_output.as_ref().map(|s| &s.schema);
        loop {
            let entry = cursor.current();
            let config = self.effective_config(entry);
            let tools = self.tools.get_tools_for_llm();
            let options = FormatOptions { schema: schema_value };
            let payload = entry.driver.format(messages, &tools, &options, &config);

            let attempt = async {
                let mut stream = entry.driver.send_streamed(payload, &config).await?;
                let mut deltas = Vec::new();
                while let Some(chunk) = stream.next().await {
                    match chunk? {
                        NormalizedChunk::ContentDelta(text) => deltas.push(text),
                        NormalizedChunk::Done(response) => return Ok((response, deltas)),
                    }
                }
                Err(AgentError::provider(entry.name.clone(), "stream ended without a terminal chunk"))
            }
            .await;

            match attempt {
                Ok(result) => return Ok(result),
                Err(e) if e.triggers_fallback() => {
                    if !cursor.advance() {
                        return Err(AgentError::AllProvidersFailed(Box::new(e)));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct AgentOrchestratorBuilder {
    identity: SessionIdentity,
    providers: Vec<ProviderEntry>,
    agent_model: Option<String>,
    tools: ToolRegistry,
    history: Arc<HistoryStore>,
    truncation: Option<Arc<crate::truncation::TruncationEngine>>,
    events: Arc<dyn EventBus>,
    usage: Arc<UsageLedger>,
    hooks: Arc<dyn AgentHooks>,
    system_prompt: Option<String>,
    reinject_system: bool,
    max_rounds: usize,
    structured_output: Option<StructuredOutput>,
    loop_detector: Option<LoopDetector>,
}

impl AgentOrchestratorBuilder {
    pub fn new(identity: SessionIdentity) -> Self {
        Self {
            identity,
            providers: Vec::new(),
            agent_model: None,
            tools: ToolRegistry::new(),
            history: Arc::new(HistoryStore::in_memory()),
            truncation: None,
            events: Arc::new(NoopEventBus),
            usage: Arc::new(UsageLedger::new()),
            hooks: Arc::new(NoopHooks),
            system_prompt: None,
            reinject_system: false,
            max_rounds: 10,
            structured_output: None,
            loop_detector: None,
        }
    }

    /// Append a provider to the fallback sequence; the first one added is
    /// tried first.
    pub fn provider(
        mut self,
        name: impl Into<String>,
        driver: Arc<dyn ProviderDriver>,
        config: ProviderConfig,
    ) -> Self {
        self.providers.push(ProviderEntry {
            name: name.into(),
            driver,
            config,
        });
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.agent_model = Some(model.into());
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = history;
        self
    }

    pub fn truncation(mut self, engine: Arc<crate::truncation::TruncationEngine>) -> Self {
        self.truncation = Some(engine);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn usage(mut self, usage: Arc<UsageLedger>) -> Self {
        self.usage = usage;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn AgentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Re-insert a fresh copy of the system instructions before every
    /// SEND instead of only seeding them once.
    pub fn reinject_system(mut self, reinject: bool) -> Self {
        self.reinject_system = reinject;
        self
    }

    pub fn max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn structured_output(mut self, schema: Value, descriptor: TypeDescriptor) -> Self {
        self.structured_output = Some(StructuredOutput { schema, descriptor });
        self
    }

    pub fn loop_detector(mut self, detector: LoopDetector) -> Self {
        self.loop_detector = Some(detector);
        self
    }

    pub fn build(self) -> AgentOrchestrator {
        AgentOrchestrator {
            identity: self.identity,
            providers: self.providers,
            agent_model: self.agent_model,
            tools: self.tools,
            history: self.history,
            truncation: self.truncation,
            events: self.events,
            usage: self.usage,
            hooks: self.hooks,
            system_prompt: self.system_prompt,
            reinject_system: self.reinject_system,
            max_rounds: self.max_rounds,
            structured_output: self.structured_output,
            loop_detector: self.loop_detector.map(AsyncMutex::new),
            session_locks: StdRwLock::new(HashMap::new()),
            last_active_provider: StdRwLock::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::message::TokenUsage;
    use crate::tools::Tool;
    use std::sync::Mutex as StdMutex;

    /// A scripted provider driver: returns canned responses from a queue,
    /// one per `send()` call, and records how it was formatted.
    struct ScriptedDriver {
        name: String,
        responses: StdMutex<std::collections::VecDeque<Result<NormalizedResponse>>>,
    }

    impl ScriptedDriver {
        fn new(name: &str, responses: Vec<Result<NormalizedResponse>>) -> Self {
            Self {
                name: name.to_string(),
                responses: StdMutex::new(responses.into()),
            }
        }

        fn failing(name: &str) -> Self {
            Self::new(
                name,
                vec![Err(AgentError::provider(name, "simulated transport failure"))],
            )
        }
    }

    #[async_trait]
    impl ProviderDriver for ScriptedDriver {
        fn name(&self) -> &str {
            &self.name
        }

        fn format(
            &self,
            _messages: &[Message],
            _tools: &[Tool],
            _options: &FormatOptions,
            _config: &ProviderConfig,
        ) -> Value {
            Value::Null
        }

        async fn send(&self, _payload: Value, _config: &ProviderConfig) -> Result<NormalizedResponse> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::provider(&self.name, "no more scripted responses")))
        }

        async fn send_streamed(
            &self,
            _payload: Value,
            _config: &ProviderConfig,
        ) -> Result<Pin<Box<dyn Stream<Item = Result<NormalizedChunk>> + Send>>> {
            unimplemented!("not exercised by these tests")
        }

        fn extract_usage(&self, _raw: &Value) -> Option<TokenUsage> {
            None
        }
    }

    fn content(text: &str) -> NormalizedResponse {
        NormalizedResponse::Content {
            text: text.to_string(),
            usage: Some(TokenUsage::new(10, 5)),
            finish_reason: FinishReason::Stop,
        }
    }

    fn tool_call_response(name: &str, args: &str) -> NormalizedResponse {
        NormalizedResponse::ToolCalls {
            calls: vec![ToolCall {
                id: "call_1".into(),
                tool_name: name.into(),
                arguments_json: args.into(),
                thought_signature: None,
            }],
            usage: Some(TokenUsage::new(8, 2)),
            finish_reason: FinishReason::ToolCalls,
        }
    }

    /// S1: a single provider returning `stop` produces the exact content
    /// text, and the history ends with system + user + assistant.
    #[tokio::test]
    async fn s1_basic_completion_returns_exact_content() {
        let driver = Arc::new(ScriptedDriver::new(
            "openai",
            vec![Ok(content("Hello! How can I assist you today?"))],
        ));
        let agent = AgentOrchestrator::builder(SessionIdentity::new("bot"))
            .provider("openai", driver, ProviderConfig::default())
            .system_prompt("You are helpful.")
            .build();

        let outcome = agent.respond(Some("Hi")).await.unwrap();
        match outcome {
            RespondOutcome::Text(text) => {
                assert_eq!(text, "Hello! How can I assist you today?");
            }
            _ => panic!("expected Text outcome"),
        }
        assert_eq!(agent.chat_history().await.unwrap().len(), 3);
    }

    struct WeatherTool;
    #[async_trait]
    impl crate::tools::ToolProvider for WeatherTool {
        fn name(&self) -> &str {
            "get_weather"
        }
        fn full_description(&self) -> String {
            "reports the weather for a location".into()
        }
        fn parameters(&self) -> Value {
            serde_json::json!({
                "type": "object",
                "properties": {"location": {"type": "string"}},
                "required": ["location"],
            })
        }
        async fn execute(&self, _call: &ToolCall) -> std::result::Result<String, String> {
            Ok(r#"{"location":"Malaysia","temperature":"32","unit":"celsius"}"#.into())
        }
    }

    /// S2: one tool round-trip, then a final answer referencing the tool
    /// result.
    #[tokio::test]
    async fn s2_tool_call_loop_completes_with_final_content() {
        let driver = Arc::new(ScriptedDriver::new(
            "openai",
            vec![
                Ok(tool_call_response("get_weather", r#"{"location":"Malaysia"}"#)),
                Ok(content("The weather in Malaysia is 32 celsius.")),
            ],
        ));
        let agent = AgentOrchestrator::builder(SessionIdentity::new("bot"))
            .provider("openai", driver, ProviderConfig::default())
            .tools(ToolRegistry::new().register(WeatherTool))
            .build();

        let outcome = agent.respond(Some("What's the weather?")).await.unwrap();
        match outcome {
            RespondOutcome::Text(text) => {
                let lower = text.to_lowercase();
                assert!(lower.contains("malaysia"));
                assert!(lower.contains("celsius"));
            }
            _ => panic!("expected Text outcome"),
        }

        let history = agent.chat_history().await.unwrap();
        assert!(history.iter().any(|m| matches!(m, Message::ToolCall { .. })));
        assert!(history.iter().any(|m| matches!(m, Message::ToolResult { .. })));
    }

    /// S3: the first provider fails with a retryable error, the second
    /// succeeds; the next call starts back at the first provider.
    #[tokio::test]
    async fn s3_fallback_advances_then_resets_next_call() {
        let first = Arc::new(ScriptedDriver::failing("invalid"));
        let second = Arc::new(ScriptedDriver::new("gemini", vec![Ok(content("ok"))]));
        let agent = AgentOrchestrator::builder(SessionIdentity::new("bot"))
            .provider("invalid", first, ProviderConfig::default())
            .provider("gemini", second, ProviderConfig::default())
            .build();

        let outcome = agent.respond(Some("hi")).await.unwrap();
        match outcome {
            RespondOutcome::Text(text) => assert_eq!(text, "ok"),
            _ => panic!("expected Text outcome"),
        }
        assert_eq!(agent.last_active_provider().as_deref(), Some("gemini"));
    }

    /// Exceeding the round-trip limit is a fatal `LoopLimit` error.
    #[tokio::test]
    async fn loop_limit_is_enforced() {
        let responses = (0..5)
            .map(|_| Ok(tool_call_response("get_weather", "{}")))
            .collect();
        let driver = Arc::new(ScriptedDriver::new("openai", responses));
        let agent = AgentOrchestrator::builder(SessionIdentity::new("bot"))
            .provider("openai", driver, ProviderConfig::default())
            .tools(ToolRegistry::new().register(WeatherTool))
            .max_rounds(2)
            .build();

        let err = agent.respond(Some("loop forever")).await.unwrap_err();
        assert!(matches!(err, AgentError::LoopLimit { .. }));
    }

    /// A registered phantom tool exits the loop with a pending call instead
    /// of executing anything.
    #[tokio::test]
    async fn phantom_tool_exits_with_pending_call() {
        let driver = Arc::new(ScriptedDriver::new(
            "openai",
            vec![Ok(tool_call_response("approve_refund", r#"{"amount":10}"#))],
        ));
        let agent = AgentOrchestrator::builder(SessionIdentity::new("bot"))
            .provider("openai", driver, ProviderConfig::default())
            .tools(ToolRegistry::new().register_phantom(
                "approve_refund",
                "ask a human",
                serde_json::json!({"type": "object"}),
            ))
            .build();

        let outcome = agent.respond(Some("refund please")).await.unwrap();
        match outcome {
            RespondOutcome::PendingToolCall(call) => assert_eq!(call.tool_name, "approve_refund"),
            _ => panic!("expected PendingToolCall outcome"),
        }
    }
}
