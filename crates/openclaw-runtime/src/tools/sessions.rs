//! Cross-session coordination tools.
//!
//! `sessions_list`, `sessions_history`, and `sessions_send` let one agent
//! observe and message other sessions. The session graph may contain cycles
//! (A messages B, B messages back); endpoints never serialise across the
//! graph — each runs on its own lane — and loops are bounded by a
//! per-session inbound rate limit.

use crate::tools::{Tool, ToolContext};
use async_trait::async_trait;
use dashmap::DashMap;
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::session::SessionKey;
use openclaw_types::tool::ToolDescriptor;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::debug;

// ---------------------------------------------------------------------------
// Inbound rate limiting
// ---------------------------------------------------------------------------

struct RateWindow {
    count: u32,
    window_start: Instant,
}

/// Rolling one-minute window of inbound cross-session messages per session.
pub struct InboundRateLimiter {
    max_per_minute: u32,
    windows: DashMap<SessionKey, RateWindow>,
}

impl InboundRateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            windows: DashMap::new(),
        }
    }

    /// Account one inbound message for `key`; false means drop it.
    pub fn allow(&self, key: &SessionKey) -> bool {
        let mut window = self.windows.entry(key.clone()).or_insert_with(|| RateWindow {
            count: 0,
            window_start: Instant::now(),
        });
        if window.window_start.elapsed().as_secs() >= 60 {
            window.count = 0;
            window.window_start = Instant::now();
        }
        if window.count >= self.max_per_minute {
            return false;
        }
        window.count += 1;
        true
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// `sessions_list` — enumerate known sessions.
pub struct SessionsListTool;

#[async_trait]
impl Tool for SessionsListTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "sessions_list".into(),
            description: "List all known agent sessions with their last-active time".into(),
            schema: json!({"type": "object", "properties": {}}),
            side_effects: false,
            requires_approval: false,
        }
    }

    async fn execute(&self, ctx: &ToolContext, _args: Value) -> OpenClawResult<String> {
        let sessions = ctx.router.list_sessions().await?;
        Ok(serde_json::to_string_pretty(&sessions)?)
    }
}

/// `sessions_history` — read another session's recent entries.
pub struct SessionsHistoryTool;

#[async_trait]
impl Tool for SessionsHistoryTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "sessions_history".into(),
            description: "Fetch the most recent entries of another session".into(),
            schema: json!({
                "type": "object",
                "properties": {
                    "session_key": {"type": "string"},
                    "limit": {"type": "integer"}
                },
                "required": ["session_key"]
            }),
            side_effects: false,
            requires_approval: false,
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> OpenClawResult<String> {
        let key: SessionKey = args["session_key"]
            .as_str()
            .unwrap_or_default()
            .parse()
            .map_err(|e| OpenClawError::BadRequest(format!("{e}")))?;
        let limit = args["limit"].as_u64().unwrap_or(20) as usize;
        let entries = ctx.router.session_history(&key, limit).await?;
        Ok(serde_json::to_string_pretty(&entries)?)
    }
}

/// `sessions_send` — inject a user message into another session.
///
/// Returns immediately; a receipt lands in both logs and the recipient's
/// turn runs on its own lane.
pub struct SessionsSendTool;

#[async_trait]
impl Tool for SessionsSendTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "sessions_send".into(),
            description: "Send a message to another agent session (fire-and-forget)".into(),
            schema: json!({
                "type": "object",
                "properties": {
                    "session_key": {"type": "string"},
                    "message": {"type": "string"}
                },
                "required": ["session_key", "message"]
            }),
            side_effects: true,
            requires_approval: false,
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> OpenClawResult<String> {
        let to: SessionKey = args["session_key"]
            .as_str()
            .unwrap_or_default()
            .parse()
            .map_err(|e| OpenClawError::BadRequest(format!("{e}")))?;
        let message = args["message"].as_str().unwrap_or_default();
        if message.is_empty() {
            return Err(OpenClawError::BadRequest("message must not be empty".into()));
        }
        ctx.router
            .send_to_session(&ctx.session_key, &to, message)
            .await?;
        debug!(from = %ctx.session_key, to = %to, "cross-session message dispatched");
        Ok(format!("delivered to {to}"))
    }
}
