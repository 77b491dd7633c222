//! RPC method dispatch.
//!
//! Each `method_call` frame resolves here. Methods are namespaced
//! (`agent.*`, `chat.*`, `sessions.*`, `config.*`, `channels.*`, `node.*`,
//! `cron.*`, `approval.*`, `send.*`) and role-gated: read-only clients get
//! the observation surface, channels get invocation, operators get
//! everything. Responses may complete out of order; callers correlate by id.

use crate::auth::Principal;
use crate::config_watch::ConfigReloader;
use crate::gateway::{ControlPlane, InvokeOrigin};
use dashmap::DashMap;
use openclaw_runtime::approval::Decision;
use openclaw_types::config::Config;
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::event::{ClientRole, Frame, RpcError};
use openclaw_types::session::SessionKey;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Default `agent.wait` timeout.
const DEFAULT_WAIT: Duration = Duration::from_secs(600);
/// How long `node.invoke` waits for the node's response.
const NODE_INVOKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything a dispatch needs.
pub struct RpcContext {
    pub cp: Arc<ControlPlane>,
    pub reloader: Arc<ConfigReloader>,
    pub nodes: Arc<NodeLinks>,
    pub principal: Principal,
}

/// Methods permitted for non-operator roles.
fn allowed(role: ClientRole, method: &str) -> bool {
    const READ: &[&str] = &[
        "agent.wait",
        "chat.history",
        "sessions.list",
        "sessions.history",
        "channels.status",
        "node.list",
        "node.describe",
        "config.get",
        "cron.list",
    ];
    const CHANNEL_EXTRA: &[&str] = &["agent.invoke", "agent.cancel", "send.outbound"];
    match role {
        ClientRole::Operator => true,
        ClientRole::Channel => READ.contains(&method) || CHANNEL_EXTRA.contains(&method),
        ClientRole::ReadOnly | ClientRole::Node => READ.contains(&method),
    }
}

pub async fn dispatch(ctx: &RpcContext, method: &str, params: Value) -> OpenClawResult<Value> {
    if !allowed(ctx.principal.role, method) {
        return Err(OpenClawError::AuthFailed(format!(
            "role {:?} may not call {method}",
            ctx.principal.role
        )));
    }
    debug!(method, principal = %ctx.principal.id, "rpc dispatch");

    match method {
        "agent.invoke" => agent_invoke(ctx, params).await,
        "agent.wait" => agent_wait(ctx, params).await,
        "agent.cancel" => agent_cancel(ctx, params),
        "chat.history" | "sessions.history" => chat_history(ctx, params).await,
        "send.outbound" => send_outbound(ctx, params).await,
        "sessions.list" => sessions_list(ctx).await,
        "sessions.send" => sessions_send(ctx, params).await,
        "config.get" => Ok(serde_json::to_value(&*ctx.cp.config.get())?),
        "config.update" => config_update(ctx, params),
        "config.reload" => config_reload(ctx),
        "channels.status" => Ok(serde_json::to_value(ctx.cp.health.all())?),
        "channels.restart" => channels_restart(ctx, params).await,
        "channels.pair" => channels_pair(ctx, params),
        "node.list" => Ok(serde_json::to_value(ctx.cp.nodes.list())?),
        "node.describe" => node_describe(ctx, params),
        "node.invoke" => node_invoke(ctx, params).await,
        "approval.decide" => approval_decide(ctx, params),
        "cron.list" => Ok(serde_json::to_value(ctx.cp.cron.list())?),
        "cron.add" => cron_add(ctx, params),
        "cron.remove" => cron_remove(ctx, params),
        other => Err(OpenClawError::UnknownMethod(other.to_string())),
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> OpenClawResult<T> {
    serde_json::from_value(params).map_err(|e| OpenClawError::BadRequest(e.to_string()))
}

// -- agent.* ---------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeParams {
    session_key: SessionKey,
    message: String,
    #[serde(default)]
    sender_id: Option<String>,
}

async fn agent_invoke(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: InvokeParams = parse(params)?;
    ctx.cp
        .invoke(
            params.session_key,
            params.message,
            params.sender_id,
            InvokeOrigin::Operator,
        )
        .await?;
    Ok(json!({"accepted": true}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitParams {
    session_key: SessionKey,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

async fn agent_wait(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: WaitParams = parse(params)?;
    let timeout = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_WAIT);
    let outcome = ctx.cp.wait(&params.session_key, timeout).await?;
    Ok(json!({
        "stopReason": outcome.stop_reason,
        "tokens": outcome.usage,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelParams {
    session_key: SessionKey,
}

fn agent_cancel(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: CancelParams = parse(params)?;
    let cancelled = ctx.cp.cancel(&params.session_key);
    Ok(json!({"cancelled": cancelled}))
}

// -- chat.* / sessions.* ---------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryParams {
    session_key: SessionKey,
    #[serde(default)]
    limit: Option<usize>,
}

async fn chat_history(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: HistoryParams = parse(params)?;
    let snapshot = ctx.cp.store.snapshot(&params.session_key).await?;
    let limit = params.limit.unwrap_or(50);
    let skip = snapshot.history.len().saturating_sub(limit);
    Ok(serde_json::to_value(&snapshot.history[skip..])?)
}

async fn sessions_list(ctx: &RpcContext) -> OpenClawResult<Value> {
    let mut sessions = Vec::new();
    for key in ctx.cp.store.list_keys()? {
        let snapshot = ctx.cp.store.snapshot(&key).await?;
        sessions.push(json!({
            "sessionKey": key,
            "lastActive": snapshot.metadata.last_active,
            "entries": snapshot.history.len(),
            "tokens": snapshot.metadata.token_counters,
        }));
    }
    Ok(Value::Array(sessions))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionsSendParams {
    session_key: SessionKey,
    message: String,
}

async fn sessions_send(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: SessionsSendParams = parse(params)?;
    ctx.cp
        .invoke(
            params.session_key,
            params.message,
            Some(format!("operator:{}", ctx.principal.id)),
            InvokeOrigin::Operator,
        )
        .await?;
    Ok(json!({"accepted": true}))
}

// -- send.* ----------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutboundParams {
    channel: String,
    recipient: String,
    message: String,
}

async fn send_outbound(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: OutboundParams = parse(params)?;
    ctx.cp
        .outbound(&params.channel, &params.recipient, &params.message)
        .await?;
    Ok(json!({"sent": true}))
}

// -- config.* --------------------------------------------------------------

fn config_update(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    #[derive(Deserialize)]
    struct UpdateParams {
        config: Config,
    }
    let params: UpdateParams = parse(params)?;
    let changed = ctx.reloader.apply_update(params.config)?;
    Ok(json!({"changedPaths": changed}))
}

fn config_reload(ctx: &RpcContext) -> OpenClawResult<Value> {
    let changed = ctx.reloader.reload_from_disk()?;
    Ok(json!({"changedPaths": changed}))
}

// -- channels.* ------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelParams {
    channel: String,
}

async fn channels_restart(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: ChannelParams = parse(params)?;
    ctx.cp.restart_channel(&params.channel).await?;
    Ok(json!({"restarted": true}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairSenderParams {
    channel: String,
    sender_id: String,
}

fn channels_pair(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: PairSenderParams = parse(params)?;
    ctx.cp.pair_sender(&params.channel, &params.sender_id)?;
    Ok(json!({"paired": true}))
}

// -- node.* ----------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeDescribeParams {
    node_id: String,
}

fn node_describe(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: NodeDescribeParams = parse(params)?;
    let node = ctx
        .cp
        .nodes
        .get(&params.node_id)
        .ok_or_else(|| OpenClawError::BadRequest(format!("unknown node {}", params.node_id)))?;
    Ok(serde_json::to_value(node)?)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeInvokeParams {
    node_id: String,
    tool: String,
    #[serde(default)]
    args: Value,
    /// Required when the tool needs approval: the gateway forwards a signed
    /// decision bound to the argument digest.
    #[serde(default)]
    approval_id: Option<String>,
}

async fn node_invoke(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: NodeInvokeParams = parse(params)?;
    let mut payload = json!({
        "tool": params.tool,
        "args": params.args,
    });
    if let Some(approval_id) = &params.approval_id {
        // Consumes the grant (exactly-once) and re-binds the digest.
        ctx.cp
            .runtime
            .approvals()
            .consume(approval_id, &params.args)?;
        let identity = ctx.cp.identity.clone();
        let signed = ctx.cp.runtime.approvals().signed_decision(
            approval_id,
            Decision::Granted,
            |signing_payload| identity.sign_challenge(signing_payload),
        )?;
        payload["approval"] = serde_json::to_value(signed)?;
    }
    ctx.nodes
        .invoke(&params.node_id, "tool.execute", payload, NODE_INVOKE_TIMEOUT)
        .await
}

// -- approval.* ------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalDecideParams {
    approval_id: String,
    decision: String,
}

fn approval_decide(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: ApprovalDecideParams = parse(params)?;
    let approve = match params.decision.as_str() {
        "granted" | "approve" | "allow" => true,
        "denied" | "deny" => false,
        other => {
            return Err(OpenClawError::BadRequest(format!(
                "unknown decision `{other}`"
            )))
        }
    };
    let decision = ctx
        .cp
        .runtime
        .approvals()
        .decide(&params.approval_id, approve)?;
    Ok(json!({"state": format!("{decision:?}").to_lowercase()}))
}

// -- cron.* ----------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CronAddParams {
    session_key: SessionKey,
    name: String,
    text: String,
    schedule: crate::cron::Schedule,
    #[serde(default)]
    one_shot: bool,
}

fn cron_add(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: CronAddParams = parse(params)?;
    let id = ctx.cp.cron.add_job(
        params.session_key,
        &params.name,
        &params.text,
        params.schedule,
        params.one_shot,
    )?;
    Ok(json!({"jobId": id}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CronRemoveParams {
    job_id: String,
}

fn cron_remove(ctx: &RpcContext, params: Value) -> OpenClawResult<Value> {
    let params: CronRemoveParams = parse(params)?;
    ctx.cp.cron.remove_job(&params.job_id)?;
    Ok(json!({"removed": true}))
}

// ---------------------------------------------------------------------------
// Node links — live connections to device nodes
// ---------------------------------------------------------------------------

/// Routes gateway-originated calls to connected nodes and correlates their
/// responses.
#[derive(Default)]
pub struct NodeLinks {
    links: DashMap<String, Arc<NodeLink>>,
}

pub struct NodeLink {
    tx: mpsc::Sender<Frame>,
    pending: DashMap<u64, oneshot::Sender<Result<Value, RpcError>>>,
    next_id: AtomicU64,
}

impl NodeLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// A node connection authenticated; register its outbound sender.
    pub fn register(&self, node_id: &str, tx: mpsc::Sender<Frame>) {
        self.links.insert(
            node_id.to_string(),
            Arc::new(NodeLink {
                tx,
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        );
    }

    pub fn unregister(&self, node_id: &str) {
        self.links.remove(node_id);
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.links.contains_key(node_id)
    }

    /// Call a method on a connected node and await its response.
    pub async fn invoke(
        &self,
        node_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> OpenClawResult<Value> {
        let link = self
            .links
            .get(node_id)
            .map(|l| l.value().clone())
            .ok_or_else(|| OpenClawError::BadRequest(format!("node {node_id} not connected")))?;

        let id = link.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        link.pending.insert(id, tx);

        let frame = Frame::MethodCall {
            id,
            method: method.to_string(),
            params,
        };
        if link.tx.send(frame).await.is_err() {
            link.pending.remove(&id);
            return Err(OpenClawError::BadRequest(format!(
                "node {node_id} disconnected"
            )));
        }

        let result = tokio::time::timeout(timeout, rx).await;
        link.pending.remove(&id);
        match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(rpc_error))) => Err(OpenClawError::BadRequest(format!(
                "node error {}: {}",
                rpc_error.code, rpc_error.message
            ))),
            Ok(Err(_)) => Err(OpenClawError::BadRequest(format!(
                "node {node_id} disconnected"
            ))),
            Err(_) => Err(OpenClawError::BadRequest(format!(
                "node {node_id} did not answer in time"
            ))),
        }
    }

    /// Route a node's `response` frame back to the pending caller.
    pub fn complete(&self, node_id: &str, id: u64, result: Option<Value>, error: Option<RpcError>) {
        let Some(link) = self.links.get(node_id) else {
            return;
        };
        if let Some((_, tx)) = link.pending.remove(&id) {
            let outcome = match error {
                Some(error) => Err(error),
                None => Ok(result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        }
    }
}
