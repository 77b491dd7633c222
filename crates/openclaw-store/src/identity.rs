//! Device identity — a long-lived Ed25519 keypair unique to this install.
//!
//! Persisted once at first boot and never rotated automatically. The public
//! half is broadcast during pairing; the private half signs RPC
//! authentication challenges. The secret file is written with mode 0600.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use openclaw_types::error::{OpenClawError, OpenClawResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use zeroize::Zeroizing;

/// Public identity file: `identity/device.json`.
#[derive(Debug, Serialize, Deserialize)]
struct DeviceFile {
    algorithm: String,
    public_key: String,
    created_at: DateTime<Utc>,
}

/// Private signing material: `identity/device-auth.json` (mode 0600).
#[derive(Serialize, Deserialize)]
struct DeviceAuthFile {
    secret_key: String,
}

/// The installation's signing identity.
pub struct DeviceIdentity {
    signing_key: SigningKey,
    created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Load the persisted identity, or generate and persist one on first
    /// boot. Write failures here are fatal (the process exits with code 3).
    pub fn load_or_create(workspace: &Path) -> OpenClawResult<Self> {
        let dir = workspace.join("identity");
        let device_path = dir.join("device.json");
        let auth_path = dir.join("device-auth.json");

        if device_path.exists() && auth_path.exists() {
            return Self::load(&device_path, &auth_path);
        }

        std::fs::create_dir_all(&dir)
            .map_err(|e| OpenClawError::StorageUnavailable(format!("create identity dir: {e}")))?;

        let mut secret = Zeroizing::new([0u8; 32]);
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, secret.as_mut_slice());
        let signing_key = SigningKey::from_bytes(&secret);
        let created_at = Utc::now();

        let device = DeviceFile {
            algorithm: "ed25519".to_string(),
            public_key: BASE64.encode(signing_key.verifying_key().as_bytes()),
            created_at,
        };
        write_json(&device_path, &device, false)?;

        let auth = DeviceAuthFile {
            secret_key: BASE64.encode(signing_key.as_bytes()),
        };
        write_json(&auth_path, &auth, true)?;

        info!(path = %device_path.display(), "generated device identity");
        Ok(Self {
            signing_key,
            created_at,
        })
    }

    fn load(device_path: &Path, auth_path: &Path) -> OpenClawResult<Self> {
        let device: DeviceFile = read_json(device_path)?;
        if device.algorithm != "ed25519" {
            return Err(OpenClawError::Internal(format!(
                "unsupported identity algorithm `{}`",
                device.algorithm
            )));
        }
        let auth: DeviceAuthFile = read_json(auth_path)?;
        let secret = Zeroizing::new(
            BASE64
                .decode(&auth.secret_key)
                .map_err(|e| OpenClawError::Internal(format!("bad secret key encoding: {e}")))?,
        );
        let bytes: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| OpenClawError::Internal("secret key must be 32 bytes".to_string()))?;
        let signing_key = SigningKey::from_bytes(&bytes);

        // Sanity: the stored public half must match the secret.
        let expected = BASE64.encode(signing_key.verifying_key().as_bytes());
        if expected != device.public_key {
            return Err(OpenClawError::Internal(
                "device.json public key does not match device-auth.json".to_string(),
            ));
        }

        Ok(Self {
            signing_key,
            created_at: device.created_at,
        })
    }

    /// Base64 of the public key, as broadcast in pairing.
    pub fn public_key(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Sign an authentication challenge nonce.
    pub fn sign_challenge(&self, nonce: &str) -> String {
        let sig: Signature = self.signing_key.sign(nonce.as_bytes());
        BASE64.encode(sig.to_bytes())
    }
}

/// Verify a base64 Ed25519 signature over a challenge nonce.
pub fn verify_challenge(public_key_b64: &str, nonce: &str, signature_b64: &str) -> bool {
    let Ok(key_bytes) = BASE64.decode(public_key_b64) else {
        return false;
    };
    let Ok(key_array) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_array) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(sig_array) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_array);
    key.verify(nonce.as_bytes(), &sig).is_ok()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> OpenClawResult<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| OpenClawError::StorageUnavailable(format!("read {}: {e}", path.display())))?;
    Ok(serde_json::from_str(&text)?)
}

/// Atomic write (tmp + rename); `restrict` applies mode 0600 before rename.
fn write_json<T: Serialize>(path: &Path, value: &T, restrict: bool) -> OpenClawResult<()> {
    let tmp: PathBuf = path.with_extension("json.tmp");
    let data = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp, data.as_bytes())
        .map_err(|e| OpenClawError::StorageUnavailable(format!("write {}: {e}", tmp.display())))?;
    #[cfg(unix)]
    if restrict {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| OpenClawError::StorageUnavailable(format!("chmod: {e}")))?;
    }
    #[cfg(not(unix))]
    let _ = restrict;
    std::fs::rename(&tmp, path)
        .map_err(|e| OpenClawError::StorageUnavailable(format!("rename: {e}")))?;
    Ok(())
}
