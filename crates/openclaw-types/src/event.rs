//! Wire frames and bus events.
//!
//! Every WebSocket message is one UTF-8 JSON [`Frame`] discriminated by a
//! top-level `type` field. Bus [`Event`]s are delivered to subscribers as
//! `event` frames; they are never persisted and never replayed across
//! reconnects — the session log is the canonical source of truth.

use crate::session::{SessionKey, StopReason, TokenUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role a client claims in its `hello` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientRole {
    /// Full control: config, approvals, sessions.
    Operator,
    /// Device-local capability provider; authenticates with its keypair.
    Node,
    /// Messaging channel adapter.
    Channel,
    /// Event observation only.
    ReadOnly,
}

/// One WebSocket message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// Client opener.
    Hello {
        role: ClientRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// Event topic filters to subscribe after auth; defaults per role.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        topics: Option<Vec<String>>,
    },
    /// Server reply to `hello`: a random nonce the client must prove against.
    Challenge { nonce: String },
    /// Client proof: Ed25519 signature over the nonce (node role) or a
    /// pairing/auth token (operator and channel roles).
    Proof {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// RPC request. `id` is unique per connection and monotonically
    /// increasing; the server echoes it in the response.
    MethodCall {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// RPC completion. Responses may arrive out of order; correlate by `id`.
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
    /// Unsolicited broadcast; never correlated with a request.
    Event { topic: String, payload: Value },
    /// Connection-level failure (handshake violations, frame parse errors).
    Error { code: String, message: String },
}

/// Error half of a `response` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

/// A bus event: a dotted topic plus a typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            topic: payload.topic().to_string(),
            payload,
        }
    }
}

/// Payloads carried on the bus, one variant per topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EventPayload {
    /// Incremental streaming output for one block of the current turn.
    ChatDelta {
        session_key: SessionKey,
        block_index: usize,
        kind: BlockKind,
        partial: String,
    },
    /// A block boundary closed.
    ChatBlockEnd {
        session_key: SessionKey,
        block_index: usize,
        kind: BlockKind,
    },
    /// Terminal event of a turn.
    ChatMessageEnd {
        session_key: SessionKey,
        stop_reason: StopReason,
        tokens: TokenUsage,
    },
    /// A privileged tool invocation awaits a human decision.
    ApprovalRequested {
        approval_id: String,
        session_key: SessionKey,
        tool: String,
        /// Redacted argument preview; never the raw invocation.
        preview: Value,
        expires_at: DateTime<Utc>,
    },
    /// An approval reached a terminal state.
    ApprovalDecided {
        approval_id: String,
        state: String,
    },
    /// Config was replaced by a validated new value.
    ConfigChanged { changed_paths: Vec<String> },
    /// A config reload was rejected; the previous value stays live.
    ConfigInvalid { path: String, message: String },
    /// Periodic adapter liveness report.
    ChannelHealth {
        channel: String,
        healthy: bool,
        detail: String,
    },
    /// Operator-facing error surface; end users never see these payloads.
    OpsError {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_key: Option<SessionKey>,
    },
    /// Receipt recorded when one session injects a message into another.
    InboundReceipt {
        from: SessionKey,
        to: SessionKey,
    },
    /// A scheduled wakeup fired.
    CronFired { job_id: String, session_key: SessionKey },
}

impl EventPayload {
    /// The canonical topic this payload is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            EventPayload::ChatDelta { .. } => "chat.delta",
            EventPayload::ChatBlockEnd { .. } => "chat.block_end",
            EventPayload::ChatMessageEnd { .. } => "chat.message_end",
            EventPayload::ApprovalRequested { .. } => "approval.requested",
            EventPayload::ApprovalDecided { .. } => "approval.decided",
            EventPayload::ConfigChanged { .. } => "config.changed",
            EventPayload::ConfigInvalid { .. } => "config.invalid",
            EventPayload::ChannelHealth { .. } => "channel.health",
            EventPayload::OpsError { .. } => "ops.error",
            EventPayload::InboundReceipt { .. } => "session.inbound_receipt",
            EventPayload::CronFired { .. } => "cron.fired",
        }
    }
}

/// Unit of streaming output: finer than a message, coarser than a character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    Code,
    ToolCall,
}
