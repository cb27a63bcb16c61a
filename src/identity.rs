/// Local agent identity: an Ed25519 keypair plus a human-chosen agent id.
///
/// The protocol modules only ever read from this; key generation and
/// persistence live here so nothing else touches raw key material.
use std::fs;
use std::path::Path;

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::MeshError;
use crate::event::now_ms;

/// Agent ids: 1–64 chars, leading alphanumeric, then alphanumeric or `.`,
/// `_`, `-`.
pub fn is_valid_agent_id(agent_id: &str) -> bool {
    let mut chars = agent_id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    agent_id.len() <= 64
        && first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[derive(Clone)]
pub struct Identity {
    seed: [u8; 32],
    /// Hex-encoded Ed25519 verifying key.
    pub public_key: String,
    pub agent_id: String,
}

/// On-disk identity file shape.
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    private_key: String,
    public_key: String,
    agent_id: String,
    created_at: u64,
}

impl Identity {
    /// Generate a fresh identity for `agent_id`.
    pub fn generate(agent_id: &str) -> Result<Self, MeshError> {
        Self::from_seed(crypto::fresh_signing_key().to_bytes(), agent_id)
    }

    /// Build an identity from existing key material.
    pub fn from_seed(seed: [u8; 32], agent_id: &str) -> Result<Self, MeshError> {
        if !is_valid_agent_id(agent_id) {
            return Err(MeshError::InvalidAgentId(agent_id.to_string()));
        }
        let public_key = hex::encode(SigningKey::from_bytes(&seed).verifying_key().to_bytes());
        Ok(Self {
            seed,
            public_key,
            agent_id: agent_id.to_string(),
        })
    }

    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.seed)
    }

    /// Persist to a JSON file readable only by the owner.
    pub fn save(&self, path: &Path) -> Result<(), MeshError> {
        let file = IdentityFile {
            private_key: hex::encode(self.seed),
            public_key: self.public_key.clone(),
            agent_id: self.agent_id.clone(),
            created_at: now_ms(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        fs::write(path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Load a previously saved identity. `Ok(None)` when no file exists
    /// or it cannot be parsed; callers treat both as "not initialized".
    pub fn load(path: &Path) -> Result<Option<Self>, MeshError> {
        let Ok(json) = fs::read_to_string(path) else {
            return Ok(None);
        };
        let Ok(file) = serde_json::from_str::<IdentityFile>(&json) else {
            return Ok(None);
        };
        let Some(seed) = hex::decode(&file.private_key)
            .ok()
            .and_then(|b| <[u8; 32]>::try_from(b).ok())
        else {
            return Ok(None);
        };
        // Public key is rederived from the seed; the stored copy is
        // informational only.
        Ok(Some(Self::from_seed(seed, &file.agent_id)?))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key)
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}
