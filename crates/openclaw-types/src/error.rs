//! Error taxonomy shared across the workspace.
//!
//! Kinds, not types: every failure that crosses a crate or wire boundary is
//! one of these variants, and each maps to a stable wire code. Errors inside
//! a turn become history entries the model can see; `AuthFailed` and
//! `SessionCorrupted` terminate the turn instead.

use crate::event::RpcError;
use thiserror::Error;

pub type OpenClawResult<T> = Result<T, OpenClawError>;

#[derive(Debug, Error)]
pub enum OpenClawError {
    // -- Handshake failures (connection closed) -----------------------------
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("sender is not paired: {0}")]
    PairingRequired(String),
    #[error("token expired")]
    TokenExpired,

    // -- Caller errors (RPC error response) ---------------------------------
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    // -- Storage ------------------------------------------------------------
    #[error("session log corrupted for {key}: {detail}")]
    SessionCorrupted { key: String, detail: String },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    // -- Model provider -----------------------------------------------------
    #[error("model call timed out after {0}s")]
    ModelTimeout(u64),
    #[error("no usable model profile remains: {0}")]
    ModelUnavailable(String),
    #[error("provider rate limited")]
    RateLimited,
    #[error("provider auth expired")]
    AuthExpired,

    // -- Tools and approvals ------------------------------------------------
    #[error("tool denied by policy: {0}")]
    ToolDenied(String),
    #[error("approval expired: {0}")]
    ApprovalExpired(String),
    #[error("approval digest mismatch for {0}")]
    ApprovalDigestMismatch(String),

    // -- Bus and config -----------------------------------------------------
    #[error("subscriber too slow, dropped")]
    SlowConsumer,
    #[error("config invalid at {path}: {message}")]
    ConfigInvalid { path: String, message: String },

    // -- Soft signals -------------------------------------------------------
    #[error("context over budget: {0}")]
    OverBudget(String),

    // -- Plumbing -----------------------------------------------------------
    #[error("internal: {0}")]
    Internal(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl OpenClawError {
    /// Stable wire code for RPC error responses and ops events.
    pub fn code(&self) -> &'static str {
        match self {
            OpenClawError::AuthFailed(_) => "auth_failed",
            OpenClawError::PairingRequired(_) => "pairing_required",
            OpenClawError::TokenExpired => "token_expired",
            OpenClawError::BadRequest(_) => "bad_request",
            OpenClawError::UnknownMethod(_) => "unknown_method",
            OpenClawError::SchemaViolation(_) => "schema_violation",
            OpenClawError::SessionCorrupted { .. } => "session_corrupted",
            OpenClawError::StorageUnavailable(_) => "storage_unavailable",
            OpenClawError::ModelTimeout(_) => "model_timeout",
            OpenClawError::ModelUnavailable(_) => "model_unavailable",
            OpenClawError::RateLimited => "rate_limited",
            OpenClawError::AuthExpired => "auth_expired",
            OpenClawError::ToolDenied(_) => "tool_denied",
            OpenClawError::ApprovalExpired(_) => "approval_expired",
            OpenClawError::ApprovalDigestMismatch(_) => "approval_digest_mismatch",
            OpenClawError::SlowConsumer => "slow_consumer",
            OpenClawError::ConfigInvalid { .. } => "config_invalid",
            OpenClawError::OverBudget(_) => "over_budget",
            OpenClawError::Internal(_) => "internal",
            OpenClawError::Io(_) => "io",
            OpenClawError::Json(_) => "json",
        }
    }

    /// True for provider failures the runtime retries via profile failover.
    pub fn is_failover(&self) -> bool {
        matches!(
            self,
            OpenClawError::RateLimited
                | OpenClawError::AuthExpired
                | OpenClawError::ModelTimeout(_)
        )
    }

    /// Render as the error half of a `response` frame.
    pub fn to_rpc(&self) -> RpcError {
        RpcError {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}
