//! The agent loop — drives one model turn for a session.
//!
//! A turn: assemble context, stream the model call, aggregate blocks, run
//! tool calls (mediating approvals for privileged ones), feed results back,
//! repeat until a non-tool stop, then seal the turn with an assistant entry
//! and a `chat.message_end` event.
//!
//! Errors inside a turn become synthetic tool results the model can see;
//! only `AuthFailed` and `SessionCorrupted` terminate the turn.

use crate::approval::{ApprovalBroker, Decision};
use crate::blocks::{BlockAggregator, BlockEvent};
use crate::failover::ProfileChain;
use crate::provider::{CompletionRequest, ProviderEvent, ProviderMessage};
use crate::tools::{SessionRouter, ToolContext, ToolRegistry};
use dashmap::DashMap;
use openclaw_context::summarizer::SummaryModel;
use openclaw_context::{AssembleRequest, ContextEngine, ModelInput};
use openclaw_store::SessionStore;
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::event::{Event, EventPayload};
use openclaw_types::model_catalog::ModelCatalog;
use openclaw_types::session::{
    EntryPayload, HistoryEntry, SessionKey, StopReason, TokenUsage,
};
use openclaw_types::tool::ToolPolicy;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Upper bound on tool rounds within one turn.
const MAX_TOOL_ROUNDS: usize = 32;

/// Where the runtime publishes bus events. Dispatch is synchronous.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Resolved agent profile for a turn.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub agent_id: String,
    pub model: String,
    pub system_prompt: String,
    /// Rendered identity documents (SOUL.md, MEMORY.md, TOOLS.md).
    pub bootstrap_docs: String,
    /// Enabled tool names; empty means every registered tool.
    pub enabled_tools: Vec<String>,
}

/// One turn request.
pub struct TurnRequest {
    pub key: SessionKey,
    pub profile: AgentProfile,
    pub user_text: String,
    pub sender_id: Option<String>,
    pub dm_history_limit: Option<usize>,
}

/// Result of a completed (or cancelled) turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
    pub text: String,
}

/// The runtime: everything needed to execute turns.
pub struct AgentRuntime {
    store: Arc<SessionStore>,
    engine: parking_lot::RwLock<Arc<ContextEngine>>,
    catalog: parking_lot::RwLock<ModelCatalog>,
    registry: Arc<ToolRegistry>,
    approvals: Arc<ApprovalBroker>,
    chains: DashMap<String, Arc<ProfileChain>>,
    events: Arc<dyn EventSink>,
    router: Arc<dyn SessionRouter>,
    search: Option<Arc<dyn openclaw_context::retrieval::MemorySearch>>,
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<SessionStore>,
        engine: Arc<ContextEngine>,
        catalog: ModelCatalog,
        registry: Arc<ToolRegistry>,
        approvals: Arc<ApprovalBroker>,
        events: Arc<dyn EventSink>,
        router: Arc<dyn SessionRouter>,
        search: Option<Arc<dyn openclaw_context::retrieval::MemorySearch>>,
    ) -> Self {
        Self {
            store,
            engine: parking_lot::RwLock::new(engine),
            catalog: parking_lot::RwLock::new(catalog),
            registry,
            approvals,
            chains: DashMap::new(),
            events,
            router,
            search,
        }
    }

    /// Swap the context engine (config hot-reload).
    pub fn set_engine(&self, engine: Arc<ContextEngine>) {
        *self.engine.write() = engine;
    }

    /// Register (or replace) the failover chain for a model.
    pub fn insert_chain(&self, model: &str, chain: Arc<ProfileChain>) {
        self.chains.insert(model.to_string(), chain);
    }

    pub fn approvals(&self) -> &Arc<ApprovalBroker> {
        &self.approvals
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    fn chain_for(&self, model: &str) -> OpenClawResult<Arc<ProfileChain>> {
        if let Some(chain) = self.chains.get(model) {
            return Ok(chain.clone());
        }
        Err(OpenClawError::ModelUnavailable(format!(
            "no provider chain registered for model `{model}`"
        )))
    }

    fn context_window(&self, model: &str) -> u64 {
        self.catalog.read().context_window(model)
    }

    fn publish(&self, payload: EventPayload) {
        self.events.publish(Event::new(payload));
    }

    fn publish_block_events(&self, key: &SessionKey, events: &[BlockEvent]) {
        for event in events {
            match event {
                BlockEvent::Delta {
                    index,
                    kind,
                    partial,
                } => self.publish(EventPayload::ChatDelta {
                    session_key: key.clone(),
                    block_index: *index,
                    kind: *kind,
                    partial: partial.clone(),
                }),
                BlockEvent::End { index, kind } => self.publish(EventPayload::ChatBlockEnd {
                    session_key: key.clone(),
                    block_index: *index,
                    kind: *kind,
                }),
            }
        }
    }

    fn publish_warnings(&self, key: &SessionKey, warnings: &[String]) {
        for warning in warnings {
            let kind = if warning.contains("summariser") {
                "summariser_failed"
            } else {
                "over_budget"
            };
            self.publish(EventPayload::OpsError {
                kind: kind.to_string(),
                message: warning.clone(),
                session_key: Some(key.clone()),
            });
        }
    }

    /// Run one turn to completion.
    pub async fn run_turn(
        &self,
        req: TurnRequest,
        cancel: watch::Receiver<bool>,
    ) -> OpenClawResult<TurnOutcome> {
        let key = req.key.clone();
        self.store
            .append(
                &key,
                HistoryEntry::new(EntryPayload::User {
                    text: req.user_text.clone(),
                    sender_id: req.sender_id.clone(),
                }),
            )
            .await?;

        let model = {
            let snapshot = self.store.snapshot(&key).await?;
            snapshot
                .metadata
                .model_override
                .clone()
                .unwrap_or_else(|| req.profile.model.clone())
        };
        let chain = self.chain_for(&model)?;
        let window = self.context_window(&model);

        let mut aggregator = BlockAggregator::new();
        let mut total_usage = TokenUsage::default();
        let mut assistant_text = String::new();

        for round in 0..MAX_TOOL_ROUNDS {
            if *cancel.borrow() {
                return self.seal_cancelled(&key, total_usage).await;
            }

            let input = self.assemble_input(&req, &model, window, &chain, &cancel).await?;
            self.publish_warnings(&key, &input.warnings);

            if let Some(summary) = &input.new_summary {
                let supersedes = self.store.snapshot(&key).await?.metadata.summary_seq;
                self.store
                    .append(
                        &key,
                        HistoryEntry::new(EntryPayload::Summary {
                            text: summary.text.clone(),
                            covers_turns: summary.covers_turns,
                            original_tokens: summary.original_tokens,
                            model: summary.model.clone(),
                            supersedes,
                        }),
                    )
                    .await?;
            }

            let request = CompletionRequest {
                model: model.clone(),
                system: input.system_prompt.clone(),
                messages: build_messages(&input),
                tools: self.registry.descriptors(&req.profile.enabled_tools),
                max_tokens: input.response_budget.max(1),
            };

            let (tx, mut rx) = mpsc::channel::<ProviderEvent>(64);
            let chain_clone = chain.clone();
            let cancel_clone = cancel.clone();
            let call =
                tokio::spawn(
                    async move { chain_clone.complete_streaming(request, tx, cancel_clone).await },
                );

            let mut tool_calls: Vec<(String, String, Value)> = Vec::new();
            let mut stop_reason = StopReason::EndTurn;
            while let Some(event) = rx.recv().await {
                match event {
                    ProviderEvent::TextDelta { text } => {
                        assistant_text.push_str(&text);
                        let events = aggregator.feed_text(&text);
                        self.publish_block_events(&key, &events);
                    }
                    ProviderEvent::ToolCall {
                        call_id,
                        tool,
                        args,
                    } => {
                        let rendered = format!("{tool} {args}");
                        let events = aggregator.tool_call_block(&rendered);
                        self.publish_block_events(&key, &events);
                        tool_calls.push((call_id, tool, args));
                    }
                    ProviderEvent::MessageEnd {
                        stop_reason: reason,
                        usage,
                    } => {
                        total_usage.add(&usage);
                        stop_reason = reason;
                    }
                }
            }

            match call.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.publish(EventPayload::OpsError {
                        kind: e.code().to_string(),
                        message: e.to_string(),
                        session_key: Some(key.clone()),
                    });
                    return Err(e);
                }
                Err(join_err) => {
                    return Err(OpenClawError::Internal(format!(
                        "model call task failed: {join_err}"
                    )))
                }
            }

            if stop_reason == StopReason::Cancelled || *cancel.borrow() {
                return self.seal_cancelled(&key, total_usage).await;
            }

            if tool_calls.is_empty() || stop_reason != StopReason::ToolUse {
                let events = aggregator.finish();
                self.publish_block_events(&key, &events);
                return self.seal_turn(&key, assistant_text, stop_reason, total_usage).await;
            }

            debug!(session = %key, round, calls = tool_calls.len(), "tool round");
            for (call_id, tool, args) in tool_calls {
                self.store
                    .append(
                        &key,
                        HistoryEntry::new(EntryPayload::ToolCall {
                            call_id: call_id.clone(),
                            tool: tool.clone(),
                            args: args.clone(),
                        }),
                    )
                    .await?;

                let result = self
                    .dispatch_tool(&key, &call_id, &tool, args, &cancel)
                    .await?;
                let (content, is_error) = match result {
                    ToolDispatch::Output(content) => (content, false),
                    ToolDispatch::Refused(reason) => (reason, true),
                    ToolDispatch::Cancelled => {
                        self.store
                            .append(
                                &key,
                                HistoryEntry::new(EntryPayload::ToolFailed {
                                    call_id: call_id.clone(),
                                    reason: "turn cancelled".to_string(),
                                }),
                            )
                            .await?;
                        return self.seal_cancelled(&key, total_usage).await;
                    }
                };
                self.store
                    .append(
                        &key,
                        HistoryEntry::new(EntryPayload::ToolResult {
                            call_id,
                            content,
                            is_error,
                        }),
                    )
                    .await?;
            }
        }

        warn!(session = %key, "tool round limit reached — sealing turn");
        let events = aggregator.finish();
        self.publish_block_events(&key, &events);
        self.seal_turn(&key, assistant_text, StopReason::EndTurn, total_usage)
            .await
    }

    async fn assemble_input(
        &self,
        req: &TurnRequest,
        model: &str,
        window: u64,
        chain: &Arc<ProfileChain>,
        cancel: &watch::Receiver<bool>,
    ) -> OpenClawResult<ModelInput> {
        let snapshot = self.store.snapshot(&req.key).await?;
        let engine = self.engine.read().clone();
        let summary_model = ChainSummaryModel {
            chain: chain.clone(),
            model: model.to_string(),
            cancel: cancel.clone(),
        };
        let input = engine
            .assemble(
                AssembleRequest {
                    system_prompt: &req.profile.system_prompt,
                    bootstrap_docs: &req.profile.bootstrap_docs,
                    history: &snapshot.history,
                    pending_user_text: &req.user_text,
                    context_window: window,
                    dm_history_limit: req.dm_history_limit,
                },
                Some(&summary_model),
                self.search.as_deref(),
            )
            .await;
        Ok(input)
    }

    async fn dispatch_tool(
        &self,
        key: &SessionKey,
        call_id: &str,
        tool: &str,
        args: Value,
        cancel: &watch::Receiver<bool>,
    ) -> OpenClawResult<ToolDispatch> {
        let Some(implementation) = self.registry.get(tool) else {
            return Ok(ToolDispatch::Refused(format!("unknown tool `{tool}`")));
        };

        // Schema validation failures return control to the model.
        if let Err(reason) = implementation.descriptor().validate_args(&args) {
            debug!(session = %key, tool, %reason, "tool arguments rejected");
            return Ok(ToolDispatch::Refused(format!("invalid arguments: {reason}")));
        }

        match self.registry.policy_for(tool) {
            ToolPolicy::Deny => {
                return Ok(ToolDispatch::Refused(format!(
                    "tool `{tool}` is denied by policy"
                )));
            }
            ToolPolicy::RequiresApproval => {
                let (ticket, event) = self.approvals.request(key, tool, &args);
                self.publish(event);
                info!(session = %key, tool, approval = %ticket.approval_id, "turn suspended for approval");

                let mut cancel = cancel.clone();
                let mut decision_rx = ticket.decision;
                let decision = loop {
                    tokio::select! {
                        decision = &mut decision_rx => {
                            break decision.unwrap_or(Decision::Denied);
                        }
                        changed = cancel.changed() => {
                            if changed.is_ok() && *cancel.borrow() {
                                return Ok(ToolDispatch::Cancelled);
                            }
                            if changed.is_err() {
                                break decision_rx.await.unwrap_or(Decision::Denied);
                            }
                        }
                    }
                };
                self.publish(EventPayload::ApprovalDecided {
                    approval_id: ticket.approval_id.clone(),
                    state: format!("{decision:?}").to_lowercase(),
                });
                match decision {
                    Decision::Granted => {
                        if let Err(e) = self.approvals.consume(&ticket.approval_id, &args) {
                            return Ok(ToolDispatch::Refused(e.to_string()));
                        }
                    }
                    Decision::Denied => {
                        return Ok(ToolDispatch::Refused(format!(
                            "tool `{tool}` denied by operator"
                        )));
                    }
                    Decision::Expired => {
                        return Ok(ToolDispatch::Refused(format!(
                            "approval expired before a decision for `{tool}`"
                        )));
                    }
                }
            }
            ToolPolicy::Allow => {}
        }

        let ctx = ToolContext {
            session_key: key.clone(),
            router: self.router.clone(),
        };
        match self.registry.execute(tool, &ctx, args).await {
            Ok(output) => Ok(ToolDispatch::Output(output)),
            // Turn-terminating kinds propagate; the rest feed the model.
            Err(e @ OpenClawError::AuthFailed(_))
            | Err(e @ OpenClawError::SessionCorrupted { .. }) => Err(e),
            Err(e) => Ok(ToolDispatch::Refused(e.to_string())),
        }
    }

    async fn seal_turn(
        &self,
        key: &SessionKey,
        text: String,
        stop_reason: StopReason,
        usage: TokenUsage,
    ) -> OpenClawResult<TurnOutcome> {
        self.store
            .append(
                key,
                HistoryEntry::new(EntryPayload::Assistant {
                    text: text.clone(),
                    stop_reason,
                    usage,
                }),
            )
            .await?;
        self.publish(EventPayload::ChatMessageEnd {
            session_key: key.clone(),
            stop_reason,
            tokens: usage,
        });
        Ok(TurnOutcome {
            stop_reason,
            usage,
            text,
        })
    }

    async fn seal_cancelled(
        &self,
        key: &SessionKey,
        usage: TokenUsage,
    ) -> OpenClawResult<TurnOutcome> {
        info!(session = %key, "turn cancelled");
        for approval_id in self.approvals.deny_session(key) {
            self.publish(EventPayload::ApprovalDecided {
                approval_id,
                state: "denied".to_string(),
            });
        }
        self.store
            .append(
                key,
                HistoryEntry::new(EntryPayload::MessageTruncated {
                    reason: "cancelled".to_string(),
                }),
            )
            .await?;
        self.publish(EventPayload::ChatMessageEnd {
            session_key: key.clone(),
            stop_reason: StopReason::Cancelled,
            tokens: usage,
        });
        Ok(TurnOutcome {
            stop_reason: StopReason::Cancelled,
            usage,
            text: String::new(),
        })
    }
}

enum ToolDispatch {
    Output(String),
    Refused(String),
    Cancelled,
}

/// Convert selected history into provider messages.
fn build_messages(input: &ModelInput) -> Vec<ProviderMessage> {
    let mut messages = Vec::with_capacity(input.history.len() + 1);
    if !input.bootstrap.is_empty() {
        // Bootstrap rides ahead of history as a user-visible preamble turn.
        messages.push(ProviderMessage::User {
            content: input.bootstrap.clone(),
        });
    }
    for entry in &input.history {
        match &entry.payload {
            EntryPayload::User { text, .. } => messages.push(ProviderMessage::User {
                content: text.clone(),
            }),
            EntryPayload::Assistant { text, .. } => messages.push(ProviderMessage::Assistant {
                content: text.clone(),
            }),
            EntryPayload::ToolCall {
                call_id,
                tool,
                args,
            } => messages.push(ProviderMessage::AssistantToolCall {
                call_id: call_id.clone(),
                tool: tool.clone(),
                args: args.clone(),
            }),
            EntryPayload::ToolResult {
                call_id,
                content,
                is_error,
            } => messages.push(ProviderMessage::ToolResult {
                call_id: call_id.clone(),
                content: content.clone(),
                is_error: *is_error,
            }),
            EntryPayload::ToolFailed { call_id, reason } => {
                messages.push(ProviderMessage::ToolResult {
                    call_id: call_id.clone(),
                    content: format!("tool failed: {reason}"),
                    is_error: true,
                })
            }
            _ => {}
        }
    }
    messages
}

/// Summariser backed by the session's own model chain.
struct ChainSummaryModel {
    chain: Arc<ProfileChain>,
    model: String,
    cancel: watch::Receiver<bool>,
}

#[async_trait::async_trait]
impl SummaryModel for ChainSummaryModel {
    async fn summarize(&self, prompt: String, max_tokens: u64) -> Result<String, String> {
        let request = CompletionRequest {
            model: self.model.clone(),
            system: String::new(),
            messages: vec![ProviderMessage::User { content: prompt }],
            tools: Vec::new(),
            max_tokens,
        };
        let (tx, mut rx) = mpsc::channel(64);
        let call = self
            .chain
            .complete_streaming(request, tx, self.cancel.clone());
        let collector = async {
            let mut text = String::new();
            while let Some(event) = rx.recv().await {
                if let ProviderEvent::TextDelta { text: delta } = event {
                    text.push_str(&delta);
                }
            }
            text
        };
        let (result, text) = tokio::join!(call, collector);
        result.map_err(|e| e.to_string())?;
        Ok(text)
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::Profile;
    use crate::provider::ModelProvider;
    use crate::tools::{SessionBrief, Tool};
    use async_trait::async_trait;
    use openclaw_types::tool::ToolDescriptor;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // -- scripted provider ---------------------------------------------------

    /// Provider that plays scripted event sequences, one per call.
    struct Scripted {
        rounds: Mutex<Vec<Vec<ProviderEvent>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(rounds: Vec<Vec<ProviderEvent>>) -> Self {
            Self {
                rounds: Mutex::new(rounds),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelProvider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete_streaming(
            &self,
            _request: CompletionRequest,
            events: mpsc::Sender<ProviderEvent>,
            _cancel: watch::Receiver<bool>,
        ) -> OpenClawResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let round = {
                let mut rounds = self.rounds.lock();
                if rounds.is_empty() {
                    vec![ProviderEvent::MessageEnd {
                        stop_reason: StopReason::EndTurn,
                        usage: TokenUsage::default(),
                    }]
                } else {
                    rounds.remove(0)
                }
            };
            for event in round {
                let _ = events.send(event).await;
            }
            Ok(())
        }
    }

    // -- recording sink ------------------------------------------------------

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl EventSink for RecordingSink {
        fn publish(&self, event: Event) {
            self.events.lock().push(event);
        }
    }

    impl RecordingSink {
        fn topics(&self) -> Vec<String> {
            self.events.lock().iter().map(|e| e.topic.clone()).collect()
        }
    }

    struct NullRouter;

    #[async_trait]
    impl SessionRouter for NullRouter {
        async fn list_sessions(&self) -> OpenClawResult<Vec<SessionBrief>> {
            Ok(vec![])
        }
        async fn session_history(
            &self,
            _key: &SessionKey,
            _limit: usize,
        ) -> OpenClawResult<Vec<HistoryEntry>> {
            Ok(vec![])
        }
        async fn send_to_session(
            &self,
            _from: &SessionKey,
            _to: &SessionKey,
            _text: &str,
        ) -> OpenClawResult<()> {
            Ok(())
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "echo".into(),
                description: "echo".into(),
                schema: json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
                side_effects: false,
                requires_approval: false,
            }
        }

        async fn execute(&self, _ctx: &ToolContext, args: Value) -> OpenClawResult<String> {
            Ok(format!("echo: {}", args["text"].as_str().unwrap_or("")))
        }
    }

    // -- harness -------------------------------------------------------------

    fn end(stop: StopReason) -> ProviderEvent {
        ProviderEvent::MessageEnd {
            stop_reason: stop,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        }
    }

    fn text(t: &str) -> ProviderEvent {
        ProviderEvent::TextDelta {
            text: t.to_string(),
        }
    }

    struct Harness {
        runtime: Arc<AgentRuntime>,
        sink: Arc<RecordingSink>,
        _tmp: tempfile::TempDir,
    }

    fn harness(rounds: Vec<Vec<ProviderEvent>>, approval_ttl_secs: i64) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(tmp.path()).unwrap());
        let engine = Arc::new(ContextEngine::new(Default::default()));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let sink = Arc::new(RecordingSink::default());
        let runtime = Arc::new(AgentRuntime::new(
            store,
            engine,
            ModelCatalog::builtin(),
            Arc::new(registry),
            Arc::new(ApprovalBroker::new(chrono::Duration::seconds(
                approval_ttl_secs,
            ))),
            sink.clone(),
            Arc::new(NullRouter),
            None,
        ));
        runtime.insert_chain(
            "claude-3.5-sonnet",
            Arc::new(ProfileChain::new(
                "claude-3.5-sonnet",
                vec![Profile {
                    name: "default".into(),
                    provider: Arc::new(Scripted::new(rounds)),
                }],
                Duration::from_secs(5),
            )),
        );
        Harness {
            runtime,
            sink,
            _tmp: tmp,
        }
    }

    fn request() -> TurnRequest {
        TurnRequest {
            key: "agent:main:telegram:dm:u42".parse().unwrap(),
            profile: AgentProfile {
                agent_id: "main".into(),
                model: "claude-3.5-sonnet".into(),
                system_prompt: "You are concise.".into(),
                bootstrap_docs: String::new(),
                enabled_tools: vec![],
            },
            user_text: "hi".into(),
            sender_id: Some("u42".into()),
            dm_history_limit: None,
        }
    }

    fn cancel_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    // -- tests ---------------------------------------------------------------

    #[tokio::test]
    async fn test_turn_happy_path() {
        // A plain turn: user entry then assistant entry, at least one text
        // delta, and a terminal message_end with end_turn.
        let h = harness(
            vec![vec![text("hello "), text("there"), end(StopReason::EndTurn)]],
            900,
        );
        let (_tx, cancel) = cancel_pair();
        let outcome = h.runtime.run_turn(request(), cancel).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::EndTurn);
        assert_eq!(outcome.text, "hello there");

        let key: SessionKey = "agent:main:telegram:dm:u42".parse().unwrap();
        let snapshot = h.runtime.store().snapshot(&key).await.unwrap();
        let kinds: Vec<&str> = snapshot.history.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["user", "assistant"]);

        let topics = h.sink.topics();
        assert!(topics.iter().filter(|t| *t == "chat.delta").count() >= 1);
        assert_eq!(topics.last().unwrap(), "chat.message_end");
    }

    #[tokio::test]
    async fn test_tool_round_records_call_and_result() {
        let h = harness(
            vec![
                vec![
                    ProviderEvent::ToolCall {
                        call_id: "c1".into(),
                        tool: "echo".into(),
                        args: json!({"text": "ping"}),
                    },
                    end(StopReason::ToolUse),
                ],
                vec![text("done"), end(StopReason::EndTurn)],
            ],
            900,
        );
        let (_tx, cancel) = cancel_pair();
        let outcome = h.runtime.run_turn(request(), cancel).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::EndTurn);

        let key: SessionKey = "agent:main:telegram:dm:u42".parse().unwrap();
        let snapshot = h.runtime.store().snapshot(&key).await.unwrap();
        let kinds: Vec<&str> = snapshot.history.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["user", "tool_call", "tool_result", "assistant"]);
        match &snapshot.history[2].payload {
            EntryPayload::ToolResult {
                content, is_error, ..
            } => {
                assert_eq!(content, "echo: ping");
                assert!(!is_error);
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_tool_args_feed_error_back() {
        let h = harness(
            vec![
                vec![
                    ProviderEvent::ToolCall {
                        call_id: "c1".into(),
                        tool: "echo".into(),
                        args: json!({"wrong": true}),
                    },
                    end(StopReason::ToolUse),
                ],
                vec![text("recovered"), end(StopReason::EndTurn)],
            ],
            900,
        );
        let (_tx, cancel) = cancel_pair();
        h.runtime.run_turn(request(), cancel).await.unwrap();

        let key: SessionKey = "agent:main:telegram:dm:u42".parse().unwrap();
        let snapshot = h.runtime.store().snapshot(&key).await.unwrap();
        match &snapshot.history[2].payload {
            EntryPayload::ToolResult {
                content, is_error, ..
            } => {
                assert!(is_error);
                assert!(content.contains("invalid arguments"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_refused_not_fatal() {
        let h = harness(
            vec![
                vec![
                    ProviderEvent::ToolCall {
                        call_id: "c1".into(),
                        tool: "rm_everything".into(),
                        args: json!({}),
                    },
                    end(StopReason::ToolUse),
                ],
                vec![end(StopReason::EndTurn)],
            ],
            900,
        );
        let (_tx, cancel) = cancel_pair();
        let outcome = h.runtime.run_turn(request(), cancel).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn test_cancellation_seals_with_truncation() {
        let h = harness(
            vec![vec![
                ProviderEvent::ToolCall {
                    call_id: "c1".into(),
                    tool: "echo".into(),
                    args: json!({"text": "x"}),
                },
                end(StopReason::ToolUse),
            ]],
            900,
        );
        let (tx, cancel) = cancel_pair();
        tx.send(true).unwrap();
        // Cancel flag observed before the tool round loops again.
        let outcome = h.runtime.run_turn(request(), cancel).await.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);

        let key: SessionKey = "agent:main:telegram:dm:u42".parse().unwrap();
        let snapshot = h.runtime.store().snapshot(&key).await.unwrap();
        assert!(snapshot
            .history
            .iter()
            .any(|e| e.kind() == "message_truncated"));
        let topics = h.sink.topics();
        assert_eq!(topics.last().unwrap(), "chat.message_end");
    }

    #[tokio::test]
    async fn test_unregistered_model_is_unavailable() {
        let h = harness(vec![], 900);
        let mut req = request();
        req.profile.model = "mystery-model".into();
        let (_tx, cancel) = cancel_pair();
        let err = h.runtime.run_turn(req, cancel).await.unwrap_err();
        assert!(matches!(err, OpenClawError::ModelUnavailable(_)));
    }
}
