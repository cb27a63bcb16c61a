/// Signed, content-addressed events, the unit of data exchanged with relays.
///
/// Wire format is JSON. The `id` is the hex SHA-256 of the canonical array
/// `[0, pubkey, created_at, kind, tags, content]` and the `sig` is an
/// Ed25519 signature over the raw 32-byte id. Both are recomputable from
/// the other fields, so events are self-verifying: anything that fails
/// `verify()` is dropped before it reaches protocol code.
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MeshError;

/// Payload protocol version carried in directory records and messages.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Event kinds ────────────────────────────────────────────────────────

/// Inner direct-message event. Never published on its own.
pub const KIND_RUMOR: u32 = 14;
/// Rumor encrypted to the recipient and signed by the real sender.
pub const KIND_SEAL: u32 = 13;
/// Seal encrypted again under a single-use key. The only layer relays see.
pub const KIND_GIFT_WRAP: u32 = 1059;
/// Replaceable directory mapping record, keyed by agent id via a `d` tag.
pub const KIND_DIRECTORY: u32 = 30078;
/// Channel root event, keyed by group id via a `d` tag.
pub const KIND_CHANNEL_CREATE: u32 = 40;
/// Channel message, referencing the root via an `e` tag.
pub const KIND_CHANNEL_MESSAGE: u32 = 42;

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before epoch")
        .as_secs()
}

/// Milliseconds since the Unix epoch. Used for logical message timestamps.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time before epoch")
        .as_millis() as u64
}

/// SHA-256 of the canonical serialization. This is the event id.
fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let canonical =
        serde_json::json!([0, pubkey, created_at, kind, tags, content]).to_string();
    Sha256::digest(canonical.as_bytes()).into()
}

/// A signed event as exchanged with relays. Immutable once signed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Content-derived identifier (hex SHA-256).
    pub id: String,
    /// Author's Ed25519 public key (hex).
    pub pubkey: String,
    /// Signer-chosen creation time (seconds). Not trusted.
    pub created_at: u64,
    /// Purpose discriminator.
    pub kind: u32,
    /// Ordered tag arrays, e.g. `["d", "agent-id"]` or `["p", "<pubkey>"]`.
    pub tags: Vec<Vec<String>>,
    /// Opaque content: JSON or armored ciphertext.
    pub content: String,
    /// Ed25519 signature over the id (hex).
    pub sig: String,
}

impl Event {
    /// Verify that `id` matches the content and `sig` is valid for `pubkey`.
    ///
    /// Uses strict verification (rejects non-canonical signatures).
    pub fn verify(&self) -> Result<(), MeshError> {
        let hash = event_hash(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex::encode(hash) != self.id {
            return Err(MeshError::MalformedRemoteData {
                reason: "event id does not match content".into(),
            });
        }
        let pk_bytes: [u8; 32] = hex::decode(&self.pubkey)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| MeshError::MalformedRemoteData {
                reason: "author key is not 32 hex-encoded bytes".into(),
            })?;
        let verifying_key = VerifyingKey::from_bytes(&pk_bytes).map_err(|_| {
            MeshError::MalformedRemoteData {
                reason: "author key is not a valid Ed25519 point".into(),
            }
        })?;
        let sig_bytes: [u8; 64] = hex::decode(&self.sig)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| MeshError::MalformedRemoteData {
                reason: "signature is not 64 hex-encoded bytes".into(),
            })?;
        let signature = Signature::from_bytes(&sig_bytes);
        verifying_key
            .verify_strict(&hash, &signature)
            .map_err(|_| MeshError::MalformedRemoteData {
                reason: "signature verification failed".into(),
            })
    }

    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All values of tags named `name`.
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
            .collect()
    }
}

/// An event without id or signature: the rumor layer of the envelope.
///
/// Serialized inside the seal ciphertext, never transported bare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Fluent builder for signed events.
///
/// # Example
/// ```ignore
/// let event = EventBuilder::new(KIND_DIRECTORY, content)
///     .tag(["d", agent_id])
///     .sign(&signing_key);
/// ```
pub struct EventBuilder {
    kind: u32,
    content: String,
    tags: Vec<Vec<String>>,
    created_at: Option<u64>,
}

impl EventBuilder {
    pub fn new(kind: u32, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    /// Append one tag array.
    pub fn tag<I, S>(mut self, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(parts.into_iter().map(Into::into).collect());
        self
    }

    /// Override the creation timestamp (defaults to now).
    pub fn created_at(mut self, secs: u64) -> Self {
        self.created_at = Some(secs);
        self
    }

    /// Compute the id, sign it, and produce the finished event.
    pub fn sign(self, signing_key: &SigningKey) -> Event {
        let pubkey = hex::encode(signing_key.verifying_key().to_bytes());
        let created_at = self.created_at.unwrap_or_else(now_secs);
        let hash = event_hash(&pubkey, created_at, self.kind, &self.tags, &self.content);
        let signature = signing_key.sign(&hash);
        Event {
            id: hex::encode(hash),
            pubkey,
            created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: hex::encode(signature.to_bytes()),
        }
    }
}

// ── Filters ────────────────────────────────────────────────────────────

/// Subscription filter. All set fields must match (conjunctive).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<String>>,
    #[serde(rename = "#d", skip_serializing_if = "Option::is_none")]
    pub d_tags: Option<Vec<String>>,
    #[serde(rename = "#e", skip_serializing_if = "Option::is_none")]
    pub e_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(pubkey.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(Vec::new).push(id.into());
        self
    }

    pub fn p_tag(mut self, pubkey: impl Into<String>) -> Self {
        self.p_tags.get_or_insert_with(Vec::new).push(pubkey.into());
        self
    }

    pub fn d_tag(mut self, value: impl Into<String>) -> Self {
        self.d_tags.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    pub fn e_tag(mut self, event_id: impl Into<String>) -> Self {
        self.e_tags.get_or_insert_with(Vec::new).push(event_id.into());
        self
    }

    pub fn since(mut self, secs: u64) -> Self {
        self.since = Some(secs);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies every set condition.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(values) = &self.p_tags {
            if !event.tag_values("p").iter().any(|v| values.iter().any(|w| w == v)) {
                return false;
            }
        }
        if let Some(values) = &self.d_tags {
            if !event.tag_values("d").iter().any(|v| values.iter().any(|w| w == v)) {
                return false;
            }
        }
        if let Some(values) = &self.e_tags {
            if !event.tag_values("e").iter().any(|v| values.iter().any(|w| w == v)) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        true
    }
}
