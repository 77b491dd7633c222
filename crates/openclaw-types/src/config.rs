//! Configuration types for the OpenClaw gateway.
//!
//! The top-level config file lives at the workspace root as `openclaw.json`,
//! `openclaw.yaml`, or `openclaw.json5`. Keys are camelCase on disk. Loading
//! is strict about top-level section names; section internals tolerate
//! missing fields via defaults. `validate()` returns hard errors with the
//! offending path; `clamp_bounds()` repairs out-of-range numeric knobs.

use crate::error::{OpenClawError, OpenClawResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// DM (direct message) policy for a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmPolicy {
    /// Unknown senders get one pairing challenge and are ignored until paired.
    #[default]
    Pairing,
    /// Unknown senders pass through, but only with an explicit `"*"` allowlist entry.
    Open,
    /// Unknown senders are dropped silently.
    Closed,
}

/// Sandbox placement for agent sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    /// All sessions run on the host.
    #[default]
    Host,
    /// Non-primary sessions run sandboxed.
    NonMain,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub agents: AgentsConfig,
    pub gateway: GatewayConfig,
    /// Open-ended provider map: each adapter declares its own id.
    pub channels: HashMap<String, ChannelConfig>,
    pub lanes: HashMap<String, LaneConfig>,
    pub cross_session: CrossSessionConfig,
    pub timeouts: TimeoutsConfig,
    /// Model catalog overrides and auth profile chains, keyed by model id.
    pub models: HashMap<String, ModelConfig>,
    pub cron: CronConfig,
}

/// `agents` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
    /// Per-agent overrides.
    pub list: Vec<AgentOverride>,
}

/// `agents.defaults` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentDefaults {
    /// Default model id.
    pub model: String,
    /// Absolute workspace root for persisted state.
    pub workspace: PathBuf,
    pub context_management: ContextManagementConfig,
    pub sandbox: SandboxConfig,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            model: "claude-3.5-sonnet".to_string(),
            workspace: PathBuf::from("~/.openclaw"),
            context_management: ContextManagementConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

/// One entry of `agents.list[]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentOverride {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Lane this agent's model calls run on (defaults to `agent:<id>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
}

/// `agents.defaults.sandbox` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfig {
    pub mode: SandboxMode,
}

/// `agents.defaults.contextManagement` section — master switch plus knobs
/// for the budget allocator, rolling summariser, and semantic retrieval.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextManagementConfig {
    pub enabled: bool,
    pub budget: BudgetConfig,
    pub rolling_summary: RollingSummaryConfig,
    pub semantic_history: SemanticHistoryConfig,
}

/// Budget ratios for one model call. Must sum to ≤ 1.0.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct BudgetConfig {
    pub system_prompt_ratio: f64,
    pub bootstrap_ratio: f64,
    pub history_ratio: f64,
    pub response_ratio: f64,
    /// Hard floor on response tokens; deficits are taken from history.
    pub min_response_tokens: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            system_prompt_ratio: 0.15,
            bootstrap_ratio: 0.10,
            history_ratio: 0.45,
            response_ratio: 0.20,
            min_response_tokens: 1_024,
        }
    }
}

/// `contextManagement.rollingSummary` knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RollingSummaryConfig {
    pub enabled: bool,
    /// Recent user turns kept verbatim outside the summary.
    pub window_size: usize,
    pub summary_max_tokens: u64,
    /// Absolute token threshold that arms summarisation (also capped at 0.8·H).
    pub trigger_threshold: u64,
}

impl Default for RollingSummaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_size: 10,
            summary_max_tokens: 2_048,
            trigger_threshold: 60_000,
        }
    }
}

/// `contextManagement.semanticHistory` knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SemanticHistoryConfig {
    pub enabled: bool,
    pub max_retrieved_chunks: usize,
    pub min_relevance_score: f64,
}

impl Default for SemanticHistoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retrieved_chunks: 5,
            min_relevance_score: 0.35,
        }
    }
}

/// `gateway` section — WebSocket listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub port: u16,
    pub bind: String,
    /// Shared operator token; pairing tokens work regardless.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 18789,
            bind: "127.0.0.1".to_string(),
            auth_token: None,
            tls: None,
        }
    }
}

impl GatewayConfig {
    /// True when the listener binds something other than loopback.
    pub fn is_non_loopback(&self) -> bool {
        !matches!(self.bind.as_str(), "127.0.0.1" | "::1" | "localhost")
    }
}

/// Operator-supplied TLS material, required off loopback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// `channels.<provider>` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    pub dm_policy: DmPolicy,
    /// Turn-based history cap for DMs on this channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dm_history_limit: Option<usize>,
    pub allowlist: Vec<String>,
    /// Per-correspondent overrides.
    pub dms: HashMap<String, DmOverride>,
}

impl ChannelConfig {
    /// Effective turn limit for a sender: per-DM override, then channel-wide.
    pub fn history_limit_for(&self, sender_id: &str) -> Option<usize> {
        self.dms
            .get(sender_id)
            .and_then(|d| d.history_limit)
            .or(self.dm_history_limit)
    }
}

/// `channels.<provider>.dms.<id>` overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct DmOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
}

/// `lanes.<name>` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LaneConfig {
    pub concurrency: usize,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// `crossSession` section — multi-agent coordination limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CrossSessionConfig {
    /// Inbound cross-session messages tolerated per session per minute.
    pub max_inbound_per_minute: u32,
}

impl Default for CrossSessionConfig {
    fn default() -> Self {
        Self {
            max_inbound_per_minute: 30,
        }
    }
}

/// `timeouts` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutsConfig {
    pub model_call_secs: u64,
    pub tool_call_secs: u64,
    pub approval_ttl_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            model_call_secs: 600,
            tool_call_secs: 60,
            approval_ttl_secs: 900,
        }
    }
}

/// `models.<id>` section — catalog override plus failover chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelConfig {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    /// Ordered auth profiles tried on RateLimited/AuthExpired.
    pub auth_profiles: Vec<AuthProfile>,
}

/// One credential set for a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    pub name: String,
    /// Env var holding the API key (never the key itself).
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// `cron` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CronConfig {
    pub max_jobs: usize,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self { max_jobs: 200 }
    }
}

// ---------------------------------------------------------------------------
// Validation and clamping
// ---------------------------------------------------------------------------

const KNOWN_SECTIONS: &[&str] = &[
    "agents",
    "gateway",
    "channels",
    "lanes",
    "crossSession",
    "timeouts",
    "models",
    "cron",
];

impl Config {
    /// Hard validation. Returns the first violation with its config path.
    pub fn validate(&self) -> OpenClawResult<()> {
        let b = &self.agents.defaults.context_management.budget;
        let ratio_sum =
            b.system_prompt_ratio + b.bootstrap_ratio + b.history_ratio + b.response_ratio;
        for (path, ratio) in [
            ("agents.defaults.contextManagement.budget.systemPromptRatio", b.system_prompt_ratio),
            ("agents.defaults.contextManagement.budget.bootstrapRatio", b.bootstrap_ratio),
            ("agents.defaults.contextManagement.budget.historyRatio", b.history_ratio),
            ("agents.defaults.contextManagement.budget.responseRatio", b.response_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(OpenClawError::ConfigInvalid {
                    path: path.to_string(),
                    message: format!("ratio {ratio} outside [0, 1]"),
                });
            }
        }
        if ratio_sum > 1.0 + f64::EPSILON {
            return Err(OpenClawError::ConfigInvalid {
                path: "agents.defaults.contextManagement.budget".to_string(),
                message: format!("ratios sum to {ratio_sum:.3}, must be ≤ 1.0"),
            });
        }

        for (name, lane) in &self.lanes {
            if lane.concurrency == 0 {
                return Err(OpenClawError::ConfigInvalid {
                    path: format!("lanes.{name}.concurrency"),
                    message: "must be ≥ 1".to_string(),
                });
            }
        }

        for (provider, channel) in &self.channels {
            if provider.is_empty()
                || !provider
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            {
                return Err(OpenClawError::ConfigInvalid {
                    path: format!("channels.{provider}"),
                    message: "provider ids must be lowercase alphanumeric".to_string(),
                });
            }
            if channel.dm_policy == DmPolicy::Open
                && !channel.allowlist.iter().any(|a| a == "*")
            {
                return Err(OpenClawError::ConfigInvalid {
                    path: format!("channels.{provider}.dmPolicy"),
                    message: "`open` requires an explicit \"*\" allowlist entry".to_string(),
                });
            }
        }

        // A non-loopback listener without TLS material must refuse to start.
        if self.gateway.is_non_loopback() && self.gateway.tls.is_none() {
            return Err(OpenClawError::ConfigInvalid {
                path: "gateway.bind".to_string(),
                message: format!(
                    "binding {} requires gateway.tls with an operator-supplied certificate",
                    self.gateway.bind
                ),
            });
        }

        if self.agents.defaults.model.is_empty() {
            return Err(OpenClawError::ConfigInvalid {
                path: "agents.defaults.model".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(())
    }

    /// Repair out-of-range numeric knobs instead of failing. Returns a
    /// warning string per repair, for the boot log.
    pub fn clamp_bounds(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        let rs = &mut self.agents.defaults.context_management.rolling_summary;
        if rs.window_size == 0 {
            rs.window_size = 1;
            warnings.push("rollingSummary.windowSize raised to 1".to_string());
        }

        let sh = &mut self.agents.defaults.context_management.semantic_history;
        if sh.max_retrieved_chunks > 50 {
            sh.max_retrieved_chunks = 50;
            warnings.push("semanticHistory.maxRetrievedChunks capped at 50".to_string());
        }

        if self.cross_session.max_inbound_per_minute == 0 {
            self.cross_session.max_inbound_per_minute = 1;
            warnings.push("crossSession.maxInboundPerMinute raised to 1".to_string());
        }

        if self.timeouts.model_call_secs == 0 {
            self.timeouts.model_call_secs = TimeoutsConfig::default().model_call_secs;
            warnings.push("timeouts.modelCallSecs reset to default".to_string());
        }

        warnings
    }

    /// Lane concurrency for a name, defaulting to 1 for undeclared lanes.
    pub fn lane_concurrency(&self, lane: &str) -> usize {
        self.lanes.get(lane).map(|l| l.concurrency).unwrap_or(1)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Config file names probed in order under the workspace root.
pub const CONFIG_FILE_NAMES: &[&str] = &["openclaw.json", "openclaw.yaml", "openclaw.json5"];

/// Locate the config file under a directory, if any.
pub fn discover_config(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// Parse config text according to its file extension, then validate section
/// names. Unknown top-level keys are a hard error with the offending path.
pub fn parse_config(path: &Path, text: &str) -> OpenClawResult<Config> {
    let value: serde_json::Value = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(text).map_err(|e| OpenClawError::ConfigInvalid {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
        }
        Some("json5") => {
            serde_json::from_str(&strip_json5(text)).map_err(|e| {
                OpenClawError::ConfigInvalid {
                    path: path.display().to_string(),
                    message: e.to_string(),
                }
            })?
        }
        _ => serde_json::from_str(text).map_err(|e| OpenClawError::ConfigInvalid {
            path: path.display().to_string(),
            message: e.to_string(),
        })?,
    };

    if let Some(map) = value.as_object() {
        for key in map.keys() {
            if !KNOWN_SECTIONS.contains(&key.as_str()) {
                return Err(OpenClawError::ConfigInvalid {
                    path: key.clone(),
                    message: "unrecognised top-level section".to_string(),
                });
            }
        }
    }

    let config: Config =
        serde_json::from_value(value).map_err(|e| OpenClawError::ConfigInvalid {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

/// Load and validate the config file at `path`.
pub fn load_config(path: &Path) -> OpenClawResult<Config> {
    let text = std::fs::read_to_string(path).map_err(|e| OpenClawError::ConfigInvalid {
        path: path.display().to_string(),
        message: format!("read failed: {e}"),
    })?;
    parse_config(path, &text)
}

/// Minimal JSON5 acceptance: strip `//` and `/* */` comments and trailing
/// commas, then parse as JSON. String contents are respected.
fn strip_json5(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    let mut in_string = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1] as char);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            ',' => {
                // Drop the comma if the next significant char closes a scope.
                let mut j = i + 1;
                while j < bytes.len() && (bytes[j] as char).is_whitespace() {
                    j += 1;
                }
                if j < bytes.len() && (bytes[j] == b'}' || bytes[j] == b']') {
                    i += 1;
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Diffing — drives `config.changed` events on hot-reload
// ---------------------------------------------------------------------------

/// Dotted paths whose values differ between two configs. Empty when equal.
pub fn changed_paths(old: &Config, new: &Config) -> Vec<String> {
    let old_value = serde_json::to_value(old).unwrap_or_default();
    let new_value = serde_json::to_value(new).unwrap_or_default();
    let mut paths = Vec::new();
    diff_values("", &old_value, &new_value, &mut paths);
    paths.sort();
    paths
}

fn diff_values(prefix: &str, old: &serde_json::Value, new: &serde_json::Value, out: &mut Vec<String>) {
    use serde_json::Value;
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                match (a.get(key), b.get(key)) {
                    (Some(av), Some(bv)) => diff_values(&path, av, bv, out),
                    _ => out.push(path),
                }
            }
        }
        (a, b) if a != b => out.push(prefix.to_string()),
        _ => {}
    }
}
