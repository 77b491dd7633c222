//! ControlPlane — assembles all subsystems and provides the main API.
//!
//! Owns the session store, agent runtime, event bus, lane scheduler, cron
//! wakeups, identity material, and channel adapters. Every inbound message
//! (channel ingress, operator RPC, cross-session send, cron wakeup) funnels
//! through one invoke queue; the dispatcher admits each turn to its agent's
//! lane and runs it on the runtime.

use crate::auth::NodeDirectory;
use crate::config_watch::{ConfigHandle, ConfigReloader};
use crate::cron::WakeupScheduler;
use crate::event_bus::EventBus;
use crate::lanes::LaneScheduler;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use openclaw_channels::{ChannelAdapter, DmGate, GateDecision, HealthRegistry, OutboundContent};
use openclaw_context::ContextEngine;
use openclaw_runtime::agent_loop::{AgentProfile, EventSink, TurnOutcome, TurnRequest};
use openclaw_runtime::approval::ApprovalBroker;
use openclaw_runtime::failover::{Profile, ProfileChain};
use openclaw_runtime::provider::create_provider;
use openclaw_runtime::tools::sessions::{
    InboundRateLimiter, SessionsHistoryTool, SessionsListTool, SessionsSendTool,
};
use openclaw_runtime::tools::{SessionBrief, SessionRouter, ToolRegistry};
use openclaw_runtime::AgentRuntime;
use openclaw_store::{DeviceIdentity, PairingRegistry, SessionStore};
use openclaw_types::config::Config;
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::event::{Event, EventPayload};
use openclaw_types::model_catalog::{ModelCatalog, ModelCatalogEntry};
use openclaw_types::session::{
    EntryPayload, HistoryEntry, SessionKey, SessionKind, SessionScope,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Default system prompt; SOUL.md refines it per agent.
const DEFAULT_SYSTEM_PROMPT: &str = "You are a personal AI assistant reachable over the \
operator's own messaging channels. Be direct and concise. Use tools when they genuinely \
help; never fabricate their output.";

/// Identity documents injected as bootstrap, in order.
const BOOTSTRAP_DOCS: &[&str] = &["SOUL.md", "MEMORY.md", "TOOLS.md"];

/// Where a turn request came from.
#[derive(Debug, Clone)]
pub enum InvokeOrigin {
    Channel,
    Operator,
    CrossSession { from: SessionKey },
    Cron { job_id: String },
}

/// One queued turn.
pub struct InvokeRequest {
    pub key: SessionKey,
    pub text: String,
    pub sender_id: Option<String>,
    pub origin: InvokeOrigin,
}

struct BusSink(Arc<EventBus>);

impl EventSink for BusSink {
    fn publish(&self, event: Event) {
        self.0.publish(event);
    }
}

/// The assembled control plane.
pub struct ControlPlane {
    workspace: PathBuf,
    pub config: Arc<ConfigHandle>,
    pub store: Arc<SessionStore>,
    pub runtime: Arc<AgentRuntime>,
    pub bus: Arc<EventBus>,
    pub lanes: Arc<LaneScheduler>,
    pub cron: Arc<WakeupScheduler>,
    pub identity: Arc<DeviceIdentity>,
    pub pairing: Arc<PairingRegistry>,
    pub nodes: Arc<NodeDirectory>,
    pub health: Arc<HealthRegistry>,
    catalog: ModelCatalog,
    adapters: DashMap<String, Arc<dyn ChannelAdapter>>,
    gates: DashMap<String, Arc<DmGate>>,
    /// Live turns per session: (turn id, cancel signal).
    active_turns: DashMap<SessionKey, Vec<(u64, watch::Sender<bool>)>>,
    next_turn_id: AtomicU64,
    invoke_tx: mpsc::Sender<InvokeRequest>,
    invoke_rx: Mutex<Option<mpsc::Receiver<InvokeRequest>>>,
}

impl ControlPlane {
    /// Assemble every subsystem from the given workspace and config.
    pub fn assemble(workspace: &Path, config_handle: Arc<ConfigHandle>) -> OpenClawResult<Arc<Self>> {
        let config = config_handle.get();

        let store = Arc::new(SessionStore::open(workspace)?);
        let bus = Arc::new(EventBus::new());
        let identity = Arc::new(DeviceIdentity::load_or_create(workspace)?);
        let pairing = Arc::new(PairingRegistry::open(workspace)?);
        let nodes = Arc::new(NodeDirectory::open(workspace)?);
        let health = Arc::new(HealthRegistry::new());

        let lanes = Arc::new(LaneScheduler::new());
        for (name, lane) in &config.lanes {
            lanes.set_concurrency(name, lane.concurrency);
        }

        let cron = Arc::new(WakeupScheduler::new(workspace, config.cron.max_jobs));
        if let Err(e) = cron.load() {
            warn!(error = %e, "cron jobs unreadable — starting with none");
        }

        let (invoke_tx, invoke_rx) = mpsc::channel::<InvokeRequest>(256);

        let rate_limiter = Arc::new(InboundRateLimiter::new(
            config.cross_session.max_inbound_per_minute,
        ));
        let router = Arc::new(Router {
            store: store.clone(),
            bus: bus.clone(),
            rate_limiter,
            invoke_tx: invoke_tx.clone(),
        });

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SessionsListTool));
        registry.register(Arc::new(SessionsHistoryTool));
        registry.register(Arc::new(SessionsSendTool));
        registry.set_default_timeout(Duration::from_secs(config.timeouts.tool_call_secs));

        let approvals = Arc::new(ApprovalBroker::new(chrono::Duration::seconds(
            config.timeouts.approval_ttl_secs as i64,
        )));

        let catalog = build_catalog(&config);
        let engine = Arc::new(ContextEngine::new(
            config.agents.defaults.context_management.clone(),
        ));

        let runtime = Arc::new(AgentRuntime::new(
            store.clone(),
            engine,
            catalog.clone(),
            Arc::new(registry),
            approvals,
            Arc::new(BusSink(bus.clone())),
            router,
            None,
        ));

        let cp = Arc::new(Self {
            workspace: workspace.to_path_buf(),
            config: config_handle,
            store,
            runtime,
            bus,
            lanes,
            cron,
            identity,
            pairing,
            nodes,
            health,
            catalog,
            adapters: DashMap::new(),
            gates: DashMap::new(),
            active_turns: DashMap::new(),
            next_turn_id: AtomicU64::new(1),
            invoke_tx,
            invoke_rx: Mutex::new(Some(invoke_rx)),
        });
        cp.build_chains(&config);
        Ok(cp)
    }

    /// Wire hot-reload consumers: lanes, cron cap, context knobs.
    pub fn wire_reloads(self: &Arc<Self>, reloader: &ConfigReloader) {
        let cp = self.clone();
        reloader.on_reload(Box::new(move |config, _paths| {
            for (name, lane) in &config.lanes {
                cp.lanes.set_concurrency(name, lane.concurrency);
            }
            cp.cron.set_max_jobs(config.cron.max_jobs);
            cp.runtime.set_engine(Arc::new(ContextEngine::new(
                config.agents.defaults.context_management.clone(),
            )));
            cp.build_chains(config);
        }));
    }

    /// Spawn the dispatcher and periodic background loops.
    pub async fn start(self: &Arc<Self>) {
        let mut invoke_rx = self
            .invoke_rx
            .lock()
            .await
            .take()
            .expect("control plane started twice");

        let cp = self.clone();
        tokio::spawn(async move {
            while let Some(request) = invoke_rx.recv().await {
                cp.dispatch(request);
            }
        });

        // Cron tick.
        let cp = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(15));
            loop {
                tick.tick().await;
                for job in cp.cron.due_jobs() {
                    debug!(job = %job.id, session = %job.session_key, "cron job due");
                    cp.cron.mark_fired(&job.id);
                    cp.bus.publish(Event::new(EventPayload::CronFired {
                        job_id: job.id.clone(),
                        session_key: job.session_key.clone(),
                    }));
                    let queued = cp
                        .invoke_tx
                        .send(InvokeRequest {
                            key: job.session_key.clone(),
                            text: job.text.clone(),
                            sender_id: None,
                            origin: InvokeOrigin::Cron {
                                job_id: job.id.clone(),
                            },
                        })
                        .await;
                    if let Err(e) = queued {
                        cp.cron.record_failure(&job.id, &e.to_string());
                    }
                }
            }
        });

        // Approval TTL sweep.
        let cp = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                for approval_id in cp.runtime.approvals().expire_due() {
                    cp.bus.publish(Event::new(EventPayload::ApprovalDecided {
                        approval_id,
                        state: "expired".to_string(),
                    }));
                }
            }
        });

        // Channel health heartbeat.
        let cp = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                for adapter in cp.adapters.iter() {
                    cp.health.record(adapter.value().health());
                }
                for report in cp.health.all() {
                    cp.bus.publish(Event::new(EventPayload::ChannelHealth {
                        channel: report.channel,
                        healthy: report.healthy,
                        detail: report.detail,
                    }));
                }
            }
        });
    }

    // -- invocation ---------------------------------------------------------

    /// Queue a turn. Returns once the request is accepted (not completed).
    pub async fn invoke(
        &self,
        key: SessionKey,
        text: String,
        sender_id: Option<String>,
        origin: InvokeOrigin,
    ) -> OpenClawResult<()> {
        self.invoke_tx
            .send(InvokeRequest {
                key,
                text,
                sender_id,
                origin,
            })
            .await
            .map_err(|_| OpenClawError::Internal("dispatcher stopped".into()))
    }

    fn dispatch(self: &Arc<Self>, request: InvokeRequest) {
        let cp = self.clone();
        tokio::spawn(async move {
            let key = request.key.clone();
            let lane = cp.lane_for(&key);
            let profile = cp.profile_for(&key);
            let dm_limit = cp.dm_limit_for(&key);

            let turn_id = cp.next_turn_id.fetch_add(1, Ordering::Relaxed);
            let (cancel_tx, cancel_rx) = watch::channel(false);
            cp.active_turns
                .entry(key.clone())
                .or_default()
                .push((turn_id, cancel_tx));

            let _permit = cp.lanes.acquire(&lane).await;
            let result = cp
                .runtime
                .run_turn(
                    TurnRequest {
                        key: key.clone(),
                        profile,
                        user_text: request.text,
                        sender_id: request.sender_id,
                        dm_history_limit: dm_limit,
                    },
                    cancel_rx,
                )
                .await;

            if let Some(mut turns) = cp.active_turns.get_mut(&key) {
                turns.retain(|(id, _)| *id != turn_id);
            }
            cp.active_turns.remove_if(&key, |_, turns| turns.is_empty());

            match (&result, &request.origin) {
                (Ok(_), InvokeOrigin::Cron { job_id }) => cp.cron.record_success(job_id),
                (Err(e), InvokeOrigin::Cron { job_id }) => {
                    cp.cron.record_failure(job_id, &e.to_string())
                }
                _ => {}
            }
            if let Err(e) = result {
                warn!(session = %key, error = %e, "turn failed");
                cp.bus.publish(Event::new(EventPayload::OpsError {
                    kind: e.code().to_string(),
                    message: e.to_string(),
                    session_key: Some(key),
                }));
            }
        });
    }

    /// Abort every in-flight turn for a session.
    pub fn cancel(&self, key: &SessionKey) -> bool {
        match self.active_turns.remove(key) {
            Some((_, turns)) if !turns.is_empty() => {
                for (_, cancel) in turns {
                    let _ = cancel.send(true);
                }
                true
            }
            _ => false,
        }
    }

    /// Block until the session's next `chat.message_end` (or the timeout).
    pub async fn wait(
        &self,
        key: &SessionKey,
        timeout: Duration,
    ) -> OpenClawResult<TurnOutcome> {
        let mut sub = self.bus.subscribe(&["chat.message_end".to_string()]);
        let wait = async {
            while let Some(event) = sub.rx.recv().await {
                if let EventPayload::ChatMessageEnd {
                    session_key,
                    stop_reason,
                    tokens,
                } = event.payload
                {
                    if &session_key == key {
                        return Ok(TurnOutcome {
                            stop_reason,
                            usage: tokens,
                            text: String::new(),
                        });
                    }
                }
            }
            Err(OpenClawError::SlowConsumer)
        };
        let result = tokio::time::timeout(timeout, wait).await;
        self.bus.unsubscribe(sub.id);
        result.map_err(|_| OpenClawError::BadRequest("agent.wait timed out".into()))?
    }

    // -- channels -----------------------------------------------------------

    /// Attach an adapter: start it, pump its inbound stream through DM
    /// gating into the invoke queue.
    pub async fn register_adapter(
        self: &Arc<Self>,
        adapter: Arc<dyn ChannelAdapter>,
    ) -> OpenClawResult<()> {
        let name = adapter.name().to_string();
        let channel_config = self
            .config
            .get()
            .channels
            .get(&name)
            .cloned()
            .unwrap_or_default();
        let gate = Arc::new(DmGate::new(&channel_config));
        let mut stream = adapter.startup(channel_config).await?;

        self.adapters.insert(name.clone(), adapter.clone());
        self.gates.insert(name.clone(), gate.clone());
        self.health.record(adapter.health());
        info!(channel = %name, "channel adapter attached");

        let cp = self.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                cp.health.touch_inbound(&name);
                let decision = if message.session_key.kind == SessionKind::Dm {
                    gate.evaluate(&message.sender_id)
                } else {
                    GateDecision::Pass
                };
                match decision {
                    GateDecision::Pass => {
                        let _ = cp
                            .invoke(
                                message.session_key,
                                message.body,
                                Some(message.sender_id),
                                InvokeOrigin::Channel,
                            )
                            .await;
                    }
                    GateDecision::Challenge => {
                        let _ = adapter
                            .send(
                                &message.sender_id,
                                OutboundContent::Text(
                                    "This assistant doesn't know you yet. Ask the operator \
                                     to pair your account before messaging."
                                        .to_string(),
                                ),
                            )
                            .await;
                        cp.bus.publish(Event::new(EventPayload::OpsError {
                            kind: "pairing_required".to_string(),
                            message: format!(
                                "unknown sender {} on {} challenged",
                                message.sender_id, name
                            ),
                            session_key: None,
                        }));
                    }
                    GateDecision::Drop => {
                        debug!(channel = %name, sender = %message.sender_id, "inbound dropped by dm policy");
                    }
                }
            }
            info!(channel = %name, "channel ingress stream ended");
        });
        Ok(())
    }

    /// Approve a sender on a channel (operator action after a challenge).
    pub fn pair_sender(&self, channel: &str, sender_id: &str) -> OpenClawResult<()> {
        let gate = self
            .gates
            .get(channel)
            .ok_or_else(|| OpenClawError::BadRequest(format!("unknown channel `{channel}`")))?;
        gate.mark_paired(sender_id);
        Ok(())
    }

    /// Deliver an outbound message through a channel adapter.
    pub async fn outbound(
        &self,
        channel: &str,
        recipient: &str,
        body: &str,
    ) -> OpenClawResult<()> {
        let adapter = self
            .adapters
            .get(channel)
            .map(|a| a.value().clone())
            .ok_or_else(|| OpenClawError::BadRequest(format!("unknown channel `{channel}`")))?;
        adapter
            .send(recipient, OutboundContent::Text(body.to_string()))
            .await
    }

    /// Stop and restart a channel adapter.
    pub async fn restart_channel(self: &Arc<Self>, channel: &str) -> OpenClawResult<()> {
        let adapter = self
            .adapters
            .get(channel)
            .map(|a| a.value().clone())
            .ok_or_else(|| OpenClawError::BadRequest(format!("unknown channel `{channel}`")))?;
        adapter.shutdown().await?;
        self.register_adapter(adapter).await
    }

    // -- resolution ---------------------------------------------------------

    fn agent_id(key: &SessionKey) -> &'static str {
        match key.scope {
            SessionScope::Main => "main",
            SessionScope::Sub => "sub",
        }
    }

    fn lane_for(&self, key: &SessionKey) -> String {
        let agent_id = Self::agent_id(key);
        self.config
            .get()
            .agents
            .list
            .iter()
            .find(|a| a.id == agent_id)
            .and_then(|a| a.lane.clone())
            .unwrap_or_else(|| format!("agent:{agent_id}"))
    }

    fn profile_for(&self, key: &SessionKey) -> AgentProfile {
        let config = self.config.get();
        let agent_id = Self::agent_id(key);
        let model = config
            .agents
            .list
            .iter()
            .find(|a| a.id == agent_id)
            .and_then(|a| a.model.clone())
            .unwrap_or_else(|| config.agents.defaults.model.clone());

        AgentProfile {
            agent_id: agent_id.to_string(),
            model,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            bootstrap_docs: self.read_bootstrap_docs(agent_id),
            enabled_tools: Vec::new(),
        }
    }

    fn read_bootstrap_docs(&self, agent_id: &str) -> String {
        let dir = self.workspace.join("agents").join(agent_id).join("agent");
        let mut parts = Vec::new();
        for doc in BOOTSTRAP_DOCS {
            if let Ok(text) = std::fs::read_to_string(dir.join(doc)) {
                if !text.trim().is_empty() {
                    parts.push(text.trim_end().to_string());
                }
            }
        }
        parts.join("\n\n")
    }

    fn dm_limit_for(&self, key: &SessionKey) -> Option<usize> {
        if key.kind != SessionKind::Dm {
            return None;
        }
        self.config
            .get()
            .channels
            .get(&key.provider)
            .and_then(|c| c.history_limit_for(&key.user_id))
    }

    fn build_chains(&self, config: &Config) {
        let timeout = Duration::from_secs(config.timeouts.model_call_secs);
        let agent_profiles = self.load_agent_auth_profiles();

        for (model_id, model_config) in &config.models {
            let mut profiles = Vec::new();
            for auth in &model_config.auth_profiles {
                match create_provider(
                    &model_config.provider,
                    std::env::var(&auth.api_key_env).ok(),
                    auth.base_url.clone(),
                ) {
                    Ok(provider) => profiles.push(Profile {
                        name: auth.name.clone(),
                        provider,
                    }),
                    Err(e) => {
                        warn!(model = %model_id, profile = %auth.name, error = %e, "auth profile skipped")
                    }
                }
            }
            // Per-agent auth-profiles.json entries extend the config chain.
            for entry in agent_profiles.iter().filter(|p| &p.model == model_id) {
                match create_provider(
                    &entry.provider,
                    std::env::var(&entry.api_key_env).ok(),
                    entry.base_url.clone(),
                ) {
                    Ok(provider) => profiles.push(Profile {
                        name: entry.name.clone(),
                        provider,
                    }),
                    Err(e) => {
                        warn!(model = %model_id, profile = %entry.name, error = %e, "agent auth profile skipped")
                    }
                }
            }
            if profiles.is_empty() {
                warn!(model = %model_id, "no usable auth profiles — model unavailable until fixed");
            }
            self.runtime
                .insert_chain(model_id, Arc::new(ProfileChain::new(model_id, profiles, timeout)));
        }

        // The default model always gets a chain, from catalog defaults.
        let default_model = &config.agents.defaults.model;
        if !config.models.contains_key(default_model) {
            if let Some(entry) = self.catalog.find(default_model) {
                match create_provider(&entry.provider, None, None) {
                    Ok(provider) => {
                        self.runtime.insert_chain(
                            default_model,
                            Arc::new(ProfileChain::new(
                                default_model,
                                vec![Profile {
                                    name: "default".to_string(),
                                    provider,
                                }],
                                timeout,
                            )),
                        );
                    }
                    Err(e) => {
                        warn!(model = %default_model, error = %e, "default model has no credentials yet")
                    }
                }
            }
        }
    }
}

/// One row of `agents/<id>/agent/auth-profiles.json`.
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentAuthProfile {
    name: String,
    model: String,
    provider: String,
    api_key_env: String,
    #[serde(default)]
    base_url: Option<String>,
}

impl ControlPlane {
    /// Credentials declared per agent under the persisted layout.
    fn load_agent_auth_profiles(&self) -> Vec<AgentAuthProfile> {
        let agents_dir = self.workspace.join("agents");
        let Ok(entries) = std::fs::read_dir(&agents_dir) else {
            return Vec::new();
        };
        let mut profiles = Vec::new();
        for agent_dir in entries.flatten() {
            let path = agent_dir.path().join("agent").join("auth-profiles.json");
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            match serde_json::from_str::<Vec<AgentAuthProfile>>(&text) {
                Ok(mut loaded) => profiles.append(&mut loaded),
                Err(e) => warn!(path = %path.display(), error = %e, "unreadable auth-profiles.json"),
            }
        }
        profiles
    }
}

fn build_catalog(config: &Config) -> ModelCatalog {
    let mut catalog = ModelCatalog::builtin();
    for (model_id, model_config) in &config.models {
        if let Some(window) = model_config.context_window {
            catalog.insert(ModelCatalogEntry {
                id: model_id.clone(),
                provider: model_config.provider.clone(),
                context_window: window,
                max_output_tokens: 8_192,
                supports_streaming: true,
                aliases: Vec::new(),
            });
        }
    }
    catalog
}

// ---------------------------------------------------------------------------
// Session router — the cross-session seam handed to tools
// ---------------------------------------------------------------------------

struct Router {
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    rate_limiter: Arc<InboundRateLimiter>,
    invoke_tx: mpsc::Sender<InvokeRequest>,
}

#[async_trait]
impl SessionRouter for Router {
    async fn list_sessions(&self) -> OpenClawResult<Vec<SessionBrief>> {
        let mut briefs = Vec::new();
        for key in self.store.list_keys()? {
            let snapshot = self.store.snapshot(&key).await?;
            briefs.push(SessionBrief {
                key,
                last_active: snapshot.metadata.last_active,
                entries: snapshot.history.len() as u64,
            });
        }
        Ok(briefs)
    }

    async fn session_history(
        &self,
        key: &SessionKey,
        limit: usize,
    ) -> OpenClawResult<Vec<HistoryEntry>> {
        let snapshot = self.store.snapshot(key).await?;
        let skip = snapshot.history.len().saturating_sub(limit);
        Ok(snapshot.history[skip..].to_vec())
    }

    async fn send_to_session(
        &self,
        from: &SessionKey,
        to: &SessionKey,
        text: &str,
    ) -> OpenClawResult<()> {
        if from == to {
            return Err(OpenClawError::BadRequest(
                "a session cannot message itself".into(),
            ));
        }
        if !self.rate_limiter.allow(to) {
            self.bus.publish(Event::new(EventPayload::OpsError {
                kind: "rate_limited".to_string(),
                message: format!("cross-session inbound to {to} dropped (rate limit)"),
                session_key: Some(to.clone()),
            }));
            return Err(OpenClawError::RateLimited);
        }

        // Receipt in the sender's log; the recipient's receipt is the
        // injected user entry its turn will append.
        self.store
            .append(
                from,
                HistoryEntry::new(EntryPayload::Other {
                    kind: "cross_session_receipt".to_string(),
                    data: serde_json::json!({
                        "to": to.to_string(),
                        "preview": text.chars().take(80).collect::<String>(),
                    }),
                }),
            )
            .await?;
        self.bus.publish(Event::new(EventPayload::InboundReceipt {
            from: from.clone(),
            to: to.clone(),
        }));

        self.invoke_tx
            .send(InvokeRequest {
                key: to.clone(),
                text: text.to_string(),
                sender_id: Some(from.to_string()),
                origin: InvokeOrigin::CrossSession { from: from.clone() },
            })
            .await
            .map_err(|_| OpenClawError::Internal("dispatcher stopped".into()))
    }
}

// Tests for the assembled control plane live in `tests/gateway_e2e.rs`;
// the pieces above are unit-tested in their own modules.
