//! Connection authentication — challenge-response handshake.
//!
//! Every connection walks `hello` → `challenge` → `proof`. Node clients
//! prove possession of their Ed25519 key by signing the nonce; operator and
//! channel clients present a pairing token (single-use) or the configured
//! gateway auth token. Any deviation terminates the connection with
//! `AuthFailed`.
//!
//! A node's first connection must carry a pairing token alongside its
//! public key; the key is then remembered in the node directory and later
//! connections authenticate by signature alone.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use openclaw_store::identity::verify_challenge;
use openclaw_store::PairingRegistry;
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::event::{ClientRole, Frame};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// An authenticated connection's identity.
#[derive(Debug, Clone)]
pub struct Principal {
    pub role: ClientRole,
    /// Stable identifier: node id for nodes, token hash prefix otherwise.
    pub id: String,
}

/// Handshake state for one connection.
pub enum Handshake {
    AwaitHello,
    AwaitProof {
        role: ClientRole,
        public_key: Option<String>,
        token_hint: Option<String>,
        nonce: String,
    },
}

/// Drives handshakes and remembers enrolled nodes.
pub struct Authenticator {
    pairing: Arc<PairingRegistry>,
    auth_token: Option<String>,
    nodes: Arc<NodeDirectory>,
}

impl Authenticator {
    pub fn new(
        pairing: Arc<PairingRegistry>,
        auth_token: Option<String>,
        nodes: Arc<NodeDirectory>,
    ) -> Self {
        Self {
            pairing,
            auth_token,
            nodes,
        }
    }

    /// Handle the `hello` frame: emit a challenge and advance the state.
    pub fn on_hello(&self, frame: &Frame) -> OpenClawResult<(Handshake, Frame)> {
        let Frame::Hello {
            role,
            public_key,
            token,
            ..
        } = frame
        else {
            return Err(OpenClawError::AuthFailed("expected hello frame".into()));
        };
        if *role == ClientRole::Node && public_key.is_none() {
            return Err(OpenClawError::AuthFailed(
                "node hello must carry a public key".into(),
            ));
        }
        let nonce = new_nonce();
        Ok((
            Handshake::AwaitProof {
                role: *role,
                public_key: public_key.clone(),
                token_hint: token.clone(),
                nonce: nonce.clone(),
            },
            Frame::Challenge { nonce },
        ))
    }

    /// Handle the `proof` frame and establish the principal.
    pub fn on_proof(&self, state: Handshake, frame: &Frame) -> OpenClawResult<Principal> {
        let Handshake::AwaitProof {
            role,
            public_key,
            token_hint,
            nonce,
        } = state
        else {
            return Err(OpenClawError::AuthFailed("proof before hello".into()));
        };
        let Frame::Proof { signature, token } = frame else {
            return Err(OpenClawError::AuthFailed("expected proof frame".into()));
        };

        match role {
            ClientRole::Node => {
                let public_key = public_key
                    .ok_or_else(|| OpenClawError::AuthFailed("missing node key".into()))?;
                let signature = signature
                    .as_deref()
                    .ok_or_else(|| OpenClawError::AuthFailed("missing signature".into()))?;
                if !verify_challenge(&public_key, &nonce, signature) {
                    warn!("node signature verification failed");
                    return Err(OpenClawError::AuthFailed("bad signature".into()));
                }
                if let Some(node) = self.nodes.find_by_key(&public_key) {
                    return Ok(Principal {
                        role,
                        id: node.node_id,
                    });
                }
                // First connection: enrolment requires a pairing token.
                let pairing_token = token
                    .as_deref()
                    .or(token_hint.as_deref())
                    .ok_or_else(|| {
                        OpenClawError::PairingRequired("unknown node key".into())
                    })?;
                let granted_role = self.pairing.consume(pairing_token)?;
                if granted_role != ClientRole::Node {
                    return Err(OpenClawError::AuthFailed(
                        "pairing token role mismatch".into(),
                    ));
                }
                let node = self.nodes.enroll(&public_key)?;
                info!(node = %node.node_id, "node enrolled");
                Ok(Principal {
                    role,
                    id: node.node_id,
                })
            }
            ClientRole::Operator | ClientRole::Channel | ClientRole::ReadOnly => {
                let presented = token
                    .as_deref()
                    .or(token_hint.as_deref())
                    .ok_or_else(|| OpenClawError::AuthFailed("missing token".into()))?;

                if let Some(expected) = self.auth_token.as_deref() {
                    if constant_time_eq(presented, expected) {
                        return Ok(Principal {
                            role,
                            id: principal_from_token(presented),
                        });
                    }
                }
                let granted_role = self.pairing.consume(presented)?;
                if granted_role != role {
                    return Err(OpenClawError::AuthFailed(
                        "pairing token role mismatch".into(),
                    ));
                }
                Ok(Principal {
                    role,
                    id: principal_from_token(presented),
                })
            }
        }
    }
}

/// ≥128-bit random challenge nonce.
fn new_nonce() -> String {
    let mut raw = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    BASE64.encode(raw)
}

/// Stable principal id derived from a bearer token.
fn principal_from_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---------------------------------------------------------------------------
// Node directory
// ---------------------------------------------------------------------------

/// A device node known to this gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub public_key: String,
    pub enrolled_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Enrolled nodes, persisted under `identity/nodes.json`.
pub struct NodeDirectory {
    persist_path: PathBuf,
    nodes: DashMap<String, NodeInfo>,
}

impl NodeDirectory {
    pub fn open(workspace: &Path) -> OpenClawResult<Self> {
        let dir = workspace.join("identity");
        std::fs::create_dir_all(&dir)
            .map_err(|e| OpenClawError::StorageUnavailable(format!("create identity dir: {e}")))?;
        let persist_path = dir.join("nodes.json");
        let nodes = DashMap::new();
        if persist_path.exists() {
            let text = std::fs::read_to_string(&persist_path)
                .map_err(|e| OpenClawError::StorageUnavailable(e.to_string()))?;
            let loaded: Vec<NodeInfo> = serde_json::from_str(&text)?;
            for node in loaded {
                nodes.insert(node.node_id.clone(), node);
            }
        }
        Ok(Self {
            persist_path,
            nodes,
        })
    }

    pub fn enroll(&self, public_key: &str) -> OpenClawResult<NodeInfo> {
        let node_id = format!("node-{}", &principal_from_token(public_key)[..12]);
        let info = NodeInfo {
            node_id: node_id.clone(),
            public_key: public_key.to_string(),
            enrolled_at: Utc::now(),
            last_seen: Some(Utc::now()),
        };
        self.nodes.insert(node_id, info.clone());
        self.persist()?;
        Ok(info)
    }

    pub fn find_by_key(&self, public_key: &str) -> Option<NodeInfo> {
        self.nodes
            .iter()
            .find(|n| n.public_key == public_key)
            .map(|n| {
                n.value().clone()
            })
    }

    pub fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    pub fn touch(&self, node_id: &str) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            node.last_seen = Some(Utc::now());
        }
    }

    pub fn list(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    fn persist(&self) -> OpenClawResult<()> {
        let nodes: Vec<NodeInfo> = self.nodes.iter().map(|n| n.value().clone()).collect();
        let data = serde_json::to_string_pretty(&nodes)?;
        let tmp = self.persist_path.with_extension("json.tmp");
        std::fs::write(&tmp, data.as_bytes())
            .map_err(|e| OpenClawError::StorageUnavailable(format!("write nodes: {e}")))?;
        std::fs::rename(&tmp, &self.persist_path)
            .map_err(|e| OpenClawError::StorageUnavailable(format!("rename nodes: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use openclaw_store::DeviceIdentity;

    fn setup(auth_token: Option<&str>) -> (Authenticator, Arc<PairingRegistry>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let pairing = Arc::new(PairingRegistry::open(tmp.path()).unwrap());
        let nodes = Arc::new(NodeDirectory::open(tmp.path()).unwrap());
        let auth = Authenticator::new(
            pairing.clone(),
            auth_token.map(|s| s.to_string()),
            nodes,
        );
        (auth, pairing, tmp)
    }

    fn hello(role: ClientRole, public_key: Option<String>, token: Option<String>) -> Frame {
        Frame::Hello {
            role,
            public_key,
            token,
            topics: None,
        }
    }

    #[test]
    fn test_operator_with_auth_token() {
        let (auth, _pairing, _tmp) = setup(Some("secret-token"));
        let (state, challenge) = auth
            .on_hello(&hello(ClientRole::Operator, None, None))
            .unwrap();
        assert!(matches!(challenge, Frame::Challenge { .. }));

        let principal = auth
            .on_proof(
                state,
                &Frame::Proof {
                    signature: None,
                    token: Some("secret-token".into()),
                },
            )
            .unwrap();
        assert_eq!(principal.role, ClientRole::Operator);
    }

    #[test]
    fn test_operator_with_wrong_token_fails() {
        let (auth, _pairing, _tmp) = setup(Some("secret-token"));
        let (state, _) = auth
            .on_hello(&hello(ClientRole::Operator, None, None))
            .unwrap();
        let err = auth
            .on_proof(
                state,
                &Frame::Proof {
                    signature: None,
                    token: Some("wrong".into()),
                },
            )
            .unwrap_err();
        assert!(matches!(err, OpenClawError::AuthFailed(_)));
    }

    #[test]
    fn test_pairing_token_single_use() {
        let (auth, pairing, _tmp) = setup(None);
        let (plaintext, _) = pairing
            .issue(ClientRole::Channel, Duration::minutes(5))
            .unwrap();

        let (state, _) = auth
            .on_hello(&hello(ClientRole::Channel, None, None))
            .unwrap();
        auth.on_proof(
            state,
            &Frame::Proof {
                signature: None,
                token: Some(plaintext.clone()),
            },
        )
        .unwrap();

        // Replaying the consumed token fails.
        let (state, _) = auth
            .on_hello(&hello(ClientRole::Channel, None, None))
            .unwrap();
        assert!(auth
            .on_proof(
                state,
                &Frame::Proof {
                    signature: None,
                    token: Some(plaintext),
                },
            )
            .is_err());
    }

    #[test]
    fn test_pairing_token_role_mismatch() {
        let (auth, pairing, _tmp) = setup(None);
        let (plaintext, _) = pairing
            .issue(ClientRole::ReadOnly, Duration::minutes(5))
            .unwrap();
        let (state, _) = auth
            .on_hello(&hello(ClientRole::Operator, None, None))
            .unwrap();
        assert!(auth
            .on_proof(
                state,
                &Frame::Proof {
                    signature: None,
                    token: Some(plaintext),
                },
            )
            .is_err());
    }

    #[test]
    fn test_node_enrolment_then_signature_only() {
        let tmp = tempfile::tempdir().unwrap();
        let device = DeviceIdentity::load_or_create(tmp.path()).unwrap();
        let (auth, pairing, _tmp) = setup(None);
        let (plaintext, _) = pairing.issue(ClientRole::Node, Duration::minutes(5)).unwrap();

        // First connect: token + signed nonce.
        let (state, challenge) = auth
            .on_hello(&hello(ClientRole::Node, Some(device.public_key()), None))
            .unwrap();
        let Frame::Challenge { nonce } = challenge else {
            panic!("expected challenge")
        };
        let principal = auth
            .on_proof(
                state,
                &Frame::Proof {
                    signature: Some(device.sign_challenge(&nonce)),
                    token: Some(plaintext),
                },
            )
            .unwrap();
        assert!(principal.id.starts_with("node-"));

        // Second connect: signature alone suffices.
        let (state, challenge) = auth
            .on_hello(&hello(ClientRole::Node, Some(device.public_key()), None))
            .unwrap();
        let Frame::Challenge { nonce } = challenge else {
            panic!("expected challenge")
        };
        let again = auth
            .on_proof(
                state,
                &Frame::Proof {
                    signature: Some(device.sign_challenge(&nonce)),
                    token: None,
                },
            )
            .unwrap();
        assert_eq!(again.id, principal.id);
    }

    #[test]
    fn test_unknown_node_without_pairing_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let device = DeviceIdentity::load_or_create(tmp.path()).unwrap();
        let (auth, _pairing, _tmp) = setup(None);

        let (state, challenge) = auth
            .on_hello(&hello(ClientRole::Node, Some(device.public_key()), None))
            .unwrap();
        let Frame::Challenge { nonce } = challenge else {
            panic!("expected challenge")
        };
        let err = auth
            .on_proof(
                state,
                &Frame::Proof {
                    signature: Some(device.sign_challenge(&nonce)),
                    token: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, OpenClawError::PairingRequired(_)));
    }

    #[test]
    fn test_node_bad_signature_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let device = DeviceIdentity::load_or_create(tmp.path()).unwrap();
        let (auth, _pairing, _tmp) = setup(None);

        let (state, _) = auth
            .on_hello(&hello(ClientRole::Node, Some(device.public_key()), None))
            .unwrap();
        let err = auth
            .on_proof(
                state,
                &Frame::Proof {
                    signature: Some(device.sign_challenge("some other nonce")),
                    token: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, OpenClawError::AuthFailed(_)));
    }

    #[test]
    fn test_nonces_unique_and_long() {
        let (auth, _pairing, _tmp) = setup(None);
        let mut nonces = std::collections::HashSet::new();
        for _ in 0..100 {
            let (_, challenge) = auth
                .on_hello(&hello(ClientRole::Operator, None, None))
                .unwrap();
            let Frame::Challenge { nonce } = challenge else {
                panic!()
            };
            assert!(nonce.len() >= 22); // ≥128 bits of entropy, base64
            nonces.insert(nonce);
        }
        assert_eq!(nonces.len(), 100);
    }

    #[test]
    fn test_node_directory_persistence() {
        let tmp = tempfile::tempdir().unwrap();
        let node_id = {
            let dir = NodeDirectory::open(tmp.path()).unwrap();
            dir.enroll("pubkey-abc").unwrap().node_id
        };
        let dir = NodeDirectory::open(tmp.path()).unwrap();
        assert_eq!(dir.get(&node_id).unwrap().public_key, "pubkey-abc");
        assert_eq!(dir.list().len(), 1);
    }
}
