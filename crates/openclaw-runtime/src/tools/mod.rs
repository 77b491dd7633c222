//! Tool registry and execution plumbing.
//!
//! The registry resolves tool names to implementations and descriptors and
//! answers the policy question (allow / deny / requires approval). Execution
//! is bounded by a per-tool timeout with a conservative default.

pub mod sessions;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::session::{HistoryEntry, SessionKey};
use openclaw_types::tool::{ToolDescriptor, ToolPolicy};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default per-tool execution timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Summary row returned by `sessions_list`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionBrief {
    pub key: SessionKey,
    pub last_active: Option<DateTime<Utc>>,
    pub entries: u64,
}

/// Cross-session operations the gateway exposes to tools.
#[async_trait]
pub trait SessionRouter: Send + Sync {
    async fn list_sessions(&self) -> OpenClawResult<Vec<SessionBrief>>;

    async fn session_history(
        &self,
        key: &SessionKey,
        limit: usize,
    ) -> OpenClawResult<Vec<HistoryEntry>>;

    /// Inject a user message into another session. Fire-and-forget: the
    /// recipient's turn is scheduled on its own lane.
    async fn send_to_session(
        &self,
        from: &SessionKey,
        to: &SessionKey,
        text: &str,
    ) -> OpenClawResult<()>;
}

/// Per-invocation context handed to tools.
pub struct ToolContext {
    pub session_key: SessionKey,
    pub router: Arc<dyn SessionRouter>,
}

/// A callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Execution timeout override; `None` uses the registry default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> OpenClawResult<String>;
}

/// Resolves tool names to implementations, descriptors, and policies.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    policy_overrides: HashMap<String, ToolPolicy>,
    default_timeout: Option<Duration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name;
        self.tools.insert(name, tool);
    }

    /// Override the policy for a tool (config-driven).
    pub fn set_policy(&mut self, name: &str, policy: ToolPolicy) {
        self.policy_overrides.insert(name.to_string(), policy);
    }

    /// Override the default execution timeout.
    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = Some(timeout);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Effective policy: explicit override, else derived from the descriptor.
    pub fn policy_for(&self, name: &str) -> ToolPolicy {
        if let Some(policy) = self.policy_overrides.get(name) {
            return *policy;
        }
        match self.tools.get(name) {
            Some(tool) if tool.descriptor().requires_approval => ToolPolicy::RequiresApproval,
            Some(_) => ToolPolicy::Allow,
            None => ToolPolicy::Deny,
        }
    }

    /// Descriptors for an agent's enabled set (empty set = everything).
    pub fn descriptors(&self, enabled: &[String]) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|t| t.descriptor())
            .filter(|d| enabled.is_empty() || enabled.iter().any(|n| n == &d.name))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Execute a tool with its timeout applied.
    pub async fn execute(
        &self,
        name: &str,
        ctx: &ToolContext,
        args: Value,
    ) -> OpenClawResult<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| OpenClawError::BadRequest(format!("unknown tool `{name}`")))?;
        let timeout = tool
            .timeout()
            .or(self.default_timeout)
            .unwrap_or(DEFAULT_TOOL_TIMEOUT);
        debug!(tool = name, ?timeout, "executing tool");
        match tokio::time::timeout(timeout, tool.execute(ctx, args)).await {
            Ok(result) => result,
            Err(_) => Err(OpenClawError::Internal(format!(
                "tool `{name}` timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }
}
