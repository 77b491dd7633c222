//! End-to-end approval mediation through the agent loop: a privileged tool
//! suspends the turn, an operator decision resumes it, and the digest
//! binding defends against argument substitution.

use async_trait::async_trait;
use openclaw_context::ContextEngine;
use openclaw_runtime::agent_loop::{AgentProfile, AgentRuntime, EventSink, TurnRequest};
use openclaw_runtime::approval::ApprovalBroker;
use openclaw_runtime::failover::{Profile, ProfileChain};
use openclaw_runtime::provider::{CompletionRequest, ModelProvider, ProviderEvent};
use openclaw_runtime::tools::{SessionBrief, SessionRouter, Tool, ToolContext, ToolRegistry};
use openclaw_store::SessionStore;
use openclaw_types::error::OpenClawResult;
use openclaw_types::event::{Event, EventPayload};
use openclaw_types::model_catalog::ModelCatalog;
use openclaw_types::session::{
    EntryPayload, HistoryEntry, SessionKey, StopReason, TokenUsage,
};
use openclaw_types::tool::ToolDescriptor;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct ShellTool {
    executed: Arc<AtomicBool>,
}

#[async_trait]
impl Tool for ShellTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "bash".into(),
            description: "Run a shell command".into(),
            schema: json!({
                "type": "object",
                "properties": {"cmd": {"type": "string"}},
                "required": ["cmd"]
            }),
            side_effects: true,
            requires_approval: true,
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> OpenClawResult<String> {
        self.executed.store(true, Ordering::SeqCst);
        Ok(format!("ran: {}", args["cmd"].as_str().unwrap_or("")))
    }
}

/// Scripted provider: one tool round, then a closing text round.
struct Scripted {
    rounds: Mutex<Vec<Vec<ProviderEvent>>>,
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

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl EventSink for RecordingSink {
    fn publish(&self, event: Event) {
        self.events.lock().push(event);
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

struct Fixture {
    runtime: Arc<AgentRuntime>,
    sink: Arc<RecordingSink>,
    executed: Arc<AtomicBool>,
    _tmp: tempfile::TempDir,
}

fn fixture(rounds: Vec<Vec<ProviderEvent>>) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::open(tmp.path()).unwrap());
    let executed = Arc::new(AtomicBool::new(false));
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ShellTool {
        executed: executed.clone(),
    }));
    let sink = Arc::new(RecordingSink::default());
    let runtime = Arc::new(AgentRuntime::new(
        store,
        Arc::new(ContextEngine::new(Default::default())),
        ModelCatalog::builtin(),
        Arc::new(registry),
        Arc::new(ApprovalBroker::new(chrono::Duration::minutes(15))),
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
                provider: Arc::new(Scripted {
                    rounds: Mutex::new(rounds),
                }),
            }],
            Duration::from_secs(5),
        )),
    );
    Fixture {
        runtime,
        sink,
        executed,
        _tmp: tmp,
    }
}

fn turn_request() -> TurnRequest {
    TurnRequest {
        key: "agent:main:telegram:dm:u42".parse().unwrap(),
        profile: AgentProfile {
            agent_id: "main".into(),
            model: "claude-3.5-sonnet".into(),
            system_prompt: "You are concise.".into(),
            bootstrap_docs: String::new(),
            enabled_tools: vec![],
        },
        user_text: "please list my files".into(),
        sender_id: Some("u42".into()),
        dm_history_limit: None,
    }
}

fn shell_round(cmd: &str) -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::ToolCall {
            call_id: "c1".into(),
            tool: "bash".into(),
            args: json!({"cmd": cmd}),
        },
        ProviderEvent::MessageEnd {
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage::default(),
        },
    ]
}

fn text_round(text: &str) -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::TextDelta {
            text: text.to_string(),
        },
        ProviderEvent::MessageEnd {
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage::default(),
        },
    ]
}

/// Grab the approval id from the recorded `approval.requested` event.
async fn wait_for_approval_id(sink: &RecordingSink) -> String {
    for _ in 0..200 {
        if let Some(id) = sink.events.lock().iter().find_map(|e| match &e.payload {
            EventPayload::ApprovalRequested { approval_id, .. } => Some(approval_id.clone()),
            _ => None,
        }) {
            return id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("approval.requested never published");
}

#[tokio::test]
async fn granted_approval_resumes_and_executes() {
    let fx = fixture(vec![shell_round("ls ~"), text_round("two files there")]);
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let runtime = fx.runtime.clone();
    let turn = tokio::spawn(async move { runtime.run_turn(turn_request(), cancel_rx).await });

    // The turn suspends on the pending approval.
    let approval_id = wait_for_approval_id(&fx.sink).await;
    assert!(!fx.executed.load(Ordering::SeqCst));

    fx.runtime.approvals().decide(&approval_id, true).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), turn)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(outcome.stop_reason, StopReason::EndTurn);
    assert!(fx.executed.load(Ordering::SeqCst));

    let key: SessionKey = "agent:main:telegram:dm:u42".parse().unwrap();
    let snapshot = fx.runtime.store().snapshot(&key).await.unwrap();
    let kinds: Vec<&str> = snapshot.history.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec!["user", "tool_call", "tool_result", "assistant"]);
    match &snapshot.history[2].payload {
        EntryPayload::ToolResult {
            content, is_error, ..
        } => {
            assert!(!is_error);
            assert!(content.contains("ran: ls ~"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn denied_approval_yields_refusal_result() {
    let fx = fixture(vec![shell_round("rm -rf /"), text_round("understood")]);
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let runtime = fx.runtime.clone();
    let turn = tokio::spawn(async move { runtime.run_turn(turn_request(), cancel_rx).await });

    let approval_id = wait_for_approval_id(&fx.sink).await;
    fx.runtime.approvals().decide(&approval_id, false).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), turn)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::EndTurn);
    assert!(!fx.executed.load(Ordering::SeqCst));

    let key: SessionKey = "agent:main:telegram:dm:u42".parse().unwrap();
    let snapshot = fx.runtime.store().snapshot(&key).await.unwrap();
    match &snapshot.history[2].payload {
        EntryPayload::ToolResult {
            content, is_error, ..
        } => {
            assert!(is_error);
            assert!(content.contains("denied"));
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_during_approval_denies_and_truncates() {
    let fx = fixture(vec![shell_round("ls"), text_round("never sent")]);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let runtime = fx.runtime.clone();
    let turn = tokio::spawn(async move { runtime.run_turn(turn_request(), cancel_rx).await });

    let _approval_id = wait_for_approval_id(&fx.sink).await;
    cancel_tx.send(true).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), turn)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::Cancelled);
    assert!(!fx.executed.load(Ordering::SeqCst));
    assert_eq!(fx.runtime.approvals().pending_count(), 0);

    let key: SessionKey = "agent:main:telegram:dm:u42".parse().unwrap();
    let snapshot = fx.runtime.store().snapshot(&key).await.unwrap();
    assert!(snapshot
        .history
        .iter()
        .any(|e| e.kind() == "message_truncated"));
}
