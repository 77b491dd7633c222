//! Approval broker — human gating for privileged tool invocations.
//!
//! Every approval binds a digest of the exact proposed arguments. A granted
//! approval is consumed by exactly one execution, and execution re-verifies
//! the digest, so replaying an `approvalId` with altered arguments fails
//! with `ApprovalDigestMismatch` and burns the approval.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::event::EventPayload;
use openclaw_types::session::SessionKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Argument-preview strings longer than this are truncated.
const PREVIEW_MAX_CHARS: usize = 64;

/// Key substrings whose values are masked entirely in previews.
const SENSITIVE_KEY_PARTS: &[&str] = &["token", "secret", "password", "key"];

/// Terminal decision for an approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Granted,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Granted,
    Denied,
    Expired,
    Consumed,
}

struct ApprovalRecord {
    session_key: SessionKey,
    tool: String,
    digest: String,
    state: State,
    issued_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
    waiter: Option<oneshot::Sender<Decision>>,
}

/// Handle returned to the agent loop when it requests an approval.
pub struct ApprovalTicket {
    pub approval_id: String,
    pub digest: String,
    /// Resolves when the operator decides or the TTL expires.
    pub decision: oneshot::Receiver<Decision>,
}

/// A gateway-signed decision forwarded to a device node. The digest binding
/// prevents the node from substituting different arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedDecision {
    pub approval_id: String,
    pub digest: String,
    pub decision: Decision,
    /// Base64 Ed25519 signature over `approval_id:digest:decision`.
    pub signature: String,
}

impl SignedDecision {
    /// The byte string the gateway signs.
    pub fn signing_payload(approval_id: &str, digest: &str, decision: Decision) -> String {
        let decision = match decision {
            Decision::Granted => "granted",
            Decision::Denied => "denied",
            Decision::Expired => "expired",
        };
        format!("{approval_id}:{digest}:{decision}")
    }
}

/// Issues, decides, expires, and consumes approvals.
pub struct ApprovalBroker {
    records: DashMap<String, ApprovalRecord>,
    ttl: Duration,
}

impl ApprovalBroker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    /// Register a pending approval for a proposed invocation.
    ///
    /// Returns the ticket for the agent loop plus the `approval.requested`
    /// event payload (with a redacted argument preview) for the bus.
    pub fn request(
        &self,
        session_key: &SessionKey,
        tool: &str,
        args: &Value,
    ) -> (ApprovalTicket, EventPayload) {
        let approval_id = new_approval_id();
        let digest = digest_args(args);
        let (tx, rx) = oneshot::channel();
        let expires_at = Utc::now() + self.ttl;

        self.records.insert(
            approval_id.clone(),
            ApprovalRecord {
                session_key: session_key.clone(),
                tool: tool.to_string(),
                digest: digest.clone(),
                state: State::Pending,
                issued_at: Utc::now(),
                decided_at: None,
                expires_at,
                waiter: Some(tx),
            },
        );

        info!(approval = %approval_id, tool, session = %session_key, "approval requested");
        let event = EventPayload::ApprovalRequested {
            approval_id: approval_id.clone(),
            session_key: session_key.clone(),
            tool: tool.to_string(),
            preview: redact_preview(args),
            expires_at,
        };

        (
            ApprovalTicket {
                approval_id,
                digest,
                decision: rx,
            },
            event,
        )
    }

    /// Apply an operator decision. Rejects anything not pending.
    pub fn decide(&self, approval_id: &str, approve: bool) -> OpenClawResult<Decision> {
        let mut record = self
            .records
            .get_mut(approval_id)
            .ok_or_else(|| OpenClawError::BadRequest(format!("unknown approval {approval_id}")))?;

        if record.state != State::Pending {
            return Err(OpenClawError::BadRequest(format!(
                "approval {approval_id} is not pending"
            )));
        }
        if record.expires_at <= Utc::now() {
            record.state = State::Expired;
            record.decided_at = Some(Utc::now());
            if let Some(tx) = record.waiter.take() {
                let _ = tx.send(Decision::Expired);
            }
            return Err(OpenClawError::ApprovalExpired(approval_id.to_string()));
        }

        let decision = if approve {
            record.state = State::Granted;
            Decision::Granted
        } else {
            record.state = State::Denied;
            Decision::Denied
        };
        record.decided_at = Some(Utc::now());
        if let Some(tx) = record.waiter.take() {
            let _ = tx.send(decision);
        }
        debug!(approval = %approval_id, ?decision, "approval decided");
        Ok(decision)
    }

    /// Consume a granted approval for execution, re-verifying the digest
    /// against the arguments actually about to run.
    ///
    /// A digest mismatch burns the approval: the original grant is marked
    /// consumed so it cannot be replayed with the original arguments either.
    pub fn consume(&self, approval_id: &str, args: &Value) -> OpenClawResult<()> {
        let mut record = self
            .records
            .get_mut(approval_id)
            .ok_or_else(|| OpenClawError::BadRequest(format!("unknown approval {approval_id}")))?;

        match record.state {
            State::Granted => {}
            State::Consumed => {
                return Err(OpenClawError::BadRequest(format!(
                    "approval {approval_id} already consumed"
                )))
            }
            State::Expired => return Err(OpenClawError::ApprovalExpired(approval_id.to_string())),
            _ => {
                return Err(OpenClawError::ToolDenied(format!(
                    "approval {approval_id} was not granted"
                )))
            }
        }

        let replay_digest = digest_args(args);
        record.state = State::Consumed;
        if replay_digest != record.digest {
            warn!(
                approval = %approval_id,
                tool = %record.tool,
                "approval digest mismatch — invocation rejected and approval burned"
            );
            return Err(OpenClawError::ApprovalDigestMismatch(
                approval_id.to_string(),
            ));
        }
        Ok(())
    }

    /// Expire pending approvals past their TTL. Returns the expired ids.
    pub fn expire_due(&self) -> Vec<String> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            if record.state == State::Pending && record.expires_at <= now {
                record.state = State::Expired;
                record.decided_at = Some(now);
                if let Some(tx) = record.waiter.take() {
                    let _ = tx.send(Decision::Expired);
                }
                expired.push(entry.key().clone());
            }
        }
        for id in &expired {
            info!(approval = %id, "approval expired");
        }
        expired
    }

    /// Deny every pending approval belonging to a cancelled turn.
    pub fn deny_session(&self, session_key: &SessionKey) -> Vec<String> {
        let mut denied = Vec::new();
        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            if record.state == State::Pending && &record.session_key == session_key {
                record.state = State::Denied;
                record.decided_at = Some(Utc::now());
                if let Some(tx) = record.waiter.take() {
                    let _ = tx.send(Decision::Denied);
                }
                denied.push(entry.key().clone());
            }
        }
        denied
    }

    /// Build the signed decision forwarded to a device node.
    pub fn signed_decision(
        &self,
        approval_id: &str,
        decision: Decision,
        sign: impl FnOnce(&str) -> String,
    ) -> OpenClawResult<SignedDecision> {
        let record = self
            .records
            .get(approval_id)
            .ok_or_else(|| OpenClawError::BadRequest(format!("unknown approval {approval_id}")))?;
        let payload = SignedDecision::signing_payload(approval_id, &record.digest, decision);
        Ok(SignedDecision {
            approval_id: approval_id.to_string(),
            digest: record.digest.clone(),
            decision,
            signature: sign(&payload),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.value().state == State::Pending)
            .count()
    }
}

/// Collision-resistant random approval id.
fn new_approval_id() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    format!("appr-{}", BASE64.encode(raw).trim_end_matches('='))
}

/// SHA-256 over canonical JSON (object keys sorted recursively).
pub fn digest_args(args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(args).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Redact an argument object for operator display: long strings truncate,
/// values under sensitive-looking keys are masked entirely.
fn redact_preview(args: &Value) -> Value {
    match args {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                let lower = key.to_lowercase();
                if SENSITIVE_KEY_PARTS.iter().any(|p| lower.contains(p)) {
                    out.insert(key.clone(), Value::String("***".to_string()));
                } else {
                    out.insert(key.clone(), redact_preview(value));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_preview).collect()),
        Value::String(s) if s.chars().count() > PREVIEW_MAX_CHARS => {
            let truncated: String = s.chars().take(PREVIEW_MAX_CHARS).collect();
            Value::String(format!("{truncated}…"))
        }
        other => other.clone(),
    }
}
