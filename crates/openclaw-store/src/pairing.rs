//! Pairing tokens — single-use bearer credentials scoped to a client role.
//!
//! Tokens are stored hashed (SHA-256) and consumed on first successful
//! `connect`. Expired or already-used tokens fail closed. The registry
//! persists to `identity/pairings.json` via atomic write.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::event::ClientRole;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub use openclaw_types::event::ClientRole as Role;

/// One issued token, stored hashed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingToken {
    pub id: String,
    /// SHA-256 hex of the plaintext token.
    pub token_hash: String,
    pub role: ClientRole,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

/// Issues and consumes pairing tokens.
pub struct PairingRegistry {
    persist_path: PathBuf,
    tokens: Mutex<Vec<PairingToken>>,
}

impl PairingRegistry {
    /// Open the registry under a workspace root, loading persisted tokens.
    pub fn open(workspace: &Path) -> OpenClawResult<Self> {
        let dir = workspace.join("identity");
        std::fs::create_dir_all(&dir)
            .map_err(|e| OpenClawError::StorageUnavailable(format!("create identity dir: {e}")))?;
        let persist_path = dir.join("pairings.json");
        let tokens = if persist_path.exists() {
            let text = std::fs::read_to_string(&persist_path)
                .map_err(|e| OpenClawError::StorageUnavailable(e.to_string()))?;
            serde_json::from_str(&text)?
        } else {
            Vec::new()
        };
        Ok(Self {
            persist_path,
            tokens: Mutex::new(tokens),
        })
    }

    /// Issue a new single-use token. Returns the plaintext (shown to the
    /// operator exactly once) and the stored record's id.
    pub fn issue(&self, role: ClientRole, ttl: Duration) -> OpenClawResult<(String, String)> {
        let mut raw = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let plaintext = URL_SAFE_NO_PAD.encode(raw);
        let id = format!("pair-{}", &hash_token(&plaintext)[..12]);

        let token = PairingToken {
            id: id.clone(),
            token_hash: hash_token(&plaintext),
            role,
            issued_at: Utc::now(),
            expires_at: Utc::now() + ttl,
            used: false,
        };

        {
            let mut tokens = self.tokens.lock();
            tokens.push(token);
            self.persist(&tokens)?;
        }
        info!(id = %id, role = ?role, "issued pairing token");
        Ok((plaintext, id))
    }

    /// Consume a plaintext token: exactly once, within its expiry.
    pub fn consume(&self, plaintext: &str) -> OpenClawResult<ClientRole> {
        let hash = hash_token(plaintext);
        let mut tokens = self.tokens.lock();
        let Some(token) = tokens.iter_mut().find(|t| t.token_hash == hash) else {
            return Err(OpenClawError::AuthFailed("unknown pairing token".into()));
        };
        if token.used {
            return Err(OpenClawError::AuthFailed(
                "pairing token already consumed".into(),
            ));
        }
        if token.expires_at <= Utc::now() {
            return Err(OpenClawError::TokenExpired);
        }
        token.used = true;
        let role = token.role;
        let id = token.id.clone();
        self.persist(&tokens)?;
        debug!(id = %id, "pairing token consumed");
        Ok(role)
    }

    /// Tokens still valid for consumption.
    pub fn pending_count(&self) -> usize {
        let now = Utc::now();
        self.tokens
            .lock()
            .iter()
            .filter(|t| !t.used && t.expires_at > now)
            .count()
    }

    /// Drop used and expired tokens from the registry.
    pub fn prune(&self) -> OpenClawResult<usize> {
        let now = Utc::now();
        let mut tokens = self.tokens.lock();
        let before = tokens.len();
        tokens.retain(|t| !t.used && t.expires_at > now);
        let removed = before - tokens.len();
        if removed > 0 {
            self.persist(&tokens)?;
        }
        Ok(removed)
    }

    fn persist(&self, tokens: &[PairingToken]) -> OpenClawResult<()> {
        let data = serde_json::to_string_pretty(tokens)?;
        let tmp = self.persist_path.with_extension("json.tmp");
        std::fs::write(&tmp, data.as_bytes())
            .map_err(|e| OpenClawError::StorageUnavailable(format!("write pairings: {e}")))?;
        std::fs::rename(&tmp, &self.persist_path)
            .map_err(|e| OpenClawError::StorageUnavailable(format!("rename pairings: {e}")))?;
        Ok(())
    }
}

fn hash_token(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    format!("{:x}", hasher.finalize())
}
