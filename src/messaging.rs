/// Private direct messaging over the three-layer envelope.
///
/// A message travels as rumor inside seal inside gift wrap. The rumor is
/// the unsigned payload event; the seal encrypts it to the recipient and
/// carries the real sender's signature; the gift wrap encrypts the seal
/// again under a single-use key, so relays see neither the sender's
/// identity nor the true send time. Each outer layer gets its own
/// timestamp jitter of up to two days into the past.
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto;
use crate::error::MeshError;
use crate::event::{
    now_ms, now_secs, Event, EventBuilder, Filter, UnsignedEvent, KIND_GIFT_WRAP, KIND_RUMOR,
    KIND_SEAL, PROTOCOL_VERSION,
};
use crate::identity::Identity;
use crate::pool::{RelayPool, SCAN_TIMEOUT};
use crate::store::{InboxMessage, MeshStore};

/// Upper bound for the random backdating of seal and wrap timestamps.
const JITTER_WINDOW_SECS: u64 = 2 * 24 * 60 * 60;

/// Inner message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub text: String,
}

/// The application payload carried in a rumor's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    pub v: u32,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub from_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<String>,
    pub payload: MessagePayload,
    /// Unique per message; also the inbox dedup key.
    pub nonce: String,
    /// Logical send time in milliseconds. The envelope timestamps are
    /// jittered, so this is the only honest clock in the message.
    pub ts: u64,
}

/// Outcome of one send: the message nonce and which relays took the wrap.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub accepted_by: Vec<String>,
}

impl DeliveryReceipt {
    pub fn delivered(&self) -> bool {
        !self.accepted_by.is_empty()
    }
}

/// Random timestamp within the jitter window, never in the future.
fn jittered_timestamp() -> u64 {
    now_secs() - (crypto::random_u64() % JITTER_WINDOW_SECS)
}

/// Build and publish a gift-wrapped direct message.
///
/// Only the outermost wrap is published. A receipt with an empty
/// `accepted_by` list means every relay refused it; that is data for the
/// caller, not an error.
pub async fn send_direct(
    pool: &RelayPool,
    identity: &Identity,
    recipient_pubkey: &str,
    recipient_agent_id: &str,
    text: &str,
) -> Result<DeliveryReceipt, MeshError> {
    let recipient_pk = crypto::decode_public_key(recipient_pubkey)?;
    let nonce = uuid::Uuid::new_v4().to_string();

    let message = MeshMessage {
        v: PROTOCOL_VERSION,
        msg_type: "direct".into(),
        from_agent: identity.agent_id.clone(),
        to_agent: Some(recipient_agent_id.to_string()),
        payload: MessagePayload { text: text.into() },
        nonce: nonce.clone(),
        ts: now_ms(),
    };

    // Layer 1: the rumor. Unsigned, addressed, honest timestamp.
    let rumor = UnsignedEvent {
        pubkey: identity.public_key.clone(),
        created_at: now_secs(),
        kind: KIND_RUMOR,
        tags: vec![vec!["p".into(), recipient_pubkey.to_string()]],
        content: serde_json::to_string(&message)?,
    };

    // Layer 2: the seal. Sender-signed, content encrypted to the
    // recipient under the long-term conversation key.
    let conversation = crypto::conversation_key(identity.seed(), &recipient_pk)?;
    let sealed_rumor = crypto::encrypt(&serde_json::to_string(&rumor)?, &conversation)?;
    let seal = EventBuilder::new(KIND_SEAL, sealed_rumor)
        .created_at(jittered_timestamp())
        .sign(&identity.signing_key());

    // Layer 3: the gift wrap. Signed by a key that exists only for this
    // one message, so the published author reveals nothing.
    let wrap_key = crypto::fresh_signing_key();
    let wrap_conversation = crypto::conversation_key(&wrap_key.to_bytes(), &recipient_pk)?;
    let wrapped_seal = crypto::encrypt(&serde_json::to_string(&seal)?, &wrap_conversation)?;
    let wrap = EventBuilder::new(KIND_GIFT_WRAP, wrapped_seal)
        .tag(["p", recipient_pubkey])
        .created_at(jittered_timestamp())
        .sign(&wrap_key);

    let outcome = pool.publish(&wrap).await?;
    Ok(DeliveryReceipt {
        message_id: nonce,
        accepted_by: outcome.accepted,
    })
}

/// Fetch and open gift wraps addressed to this identity.
///
/// Returns only messages not seen before, oldest first by logical
/// timestamp. Wraps that fail to open at any layer are dropped quietly;
/// on a public relay that is routine, not exceptional.
pub async fn receive_direct(
    pool: &RelayPool,
    store: &MeshStore,
    identity: &Identity,
    since: Option<u64>,
) -> Result<Vec<MeshMessage>, MeshError> {
    let mut filter = Filter::new()
        .kind(KIND_GIFT_WRAP)
        .p_tag(identity.public_key.clone());
    if let Some(since) = since {
        // Widen by the jitter window or backdated wraps would be missed.
        filter = filter.since(since.saturating_sub(JITTER_WINDOW_SECS));
    }
    let wraps = pool.query(&filter, SCAN_TIMEOUT).await?;

    let mut fresh = Vec::new();
    for wrap in &wraps {
        let Some((message, sender_pubkey)) = unwrap_envelope(wrap, identity) else {
            continue;
        };
        let inserted = store.append_inbox_if_absent(&InboxMessage {
            id: message.nonce.clone(),
            from_pubkey: sender_pubkey,
            from_agent_id: Some(message.from_agent.clone()),
            content: message.payload.text.clone(),
            ts: message.ts,
            read: false,
        })?;
        if inserted {
            fresh.push(message);
        }
    }

    fresh.sort_by_key(|m| m.ts);
    Ok(fresh)
}

/// Open all three layers of one gift wrap. Returns the message and the
/// seal author's pubkey, or `None` for anything that does not check out.
fn unwrap_envelope(wrap: &Event, identity: &Identity) -> Option<(MeshMessage, String)> {
    let wrap_pk = crypto::decode_public_key(&wrap.pubkey).ok()?;
    let wrap_key = crypto::conversation_key(identity.seed(), &wrap_pk).ok()?;
    let seal_json = match crypto::decrypt(&wrap.content, &wrap_key) {
        Ok(json) => json,
        Err(err) => {
            debug!(wrap = %wrap.id, error = %err, "cannot open gift wrap");
            return None;
        }
    };

    let seal: Event = serde_json::from_str(&seal_json).ok()?;
    if seal.kind != KIND_SEAL {
        return None;
    }
    // The seal is where the sender's signature lives; an unverifiable
    // seal means a forged or corrupted envelope.
    if let Err(err) = seal.verify() {
        debug!(wrap = %wrap.id, error = %err, "seal failed verification");
        return None;
    }

    let seal_pk = crypto::decode_public_key(&seal.pubkey).ok()?;
    let conversation = crypto::conversation_key(identity.seed(), &seal_pk).ok()?;
    let rumor_json = crypto::decrypt(&seal.content, &conversation).ok()?;

    let rumor: UnsignedEvent = serde_json::from_str(&rumor_json).ok()?;
    if rumor.kind != KIND_RUMOR || rumor.pubkey != seal.pubkey {
        return None;
    }

    let message: MeshMessage = serde_json::from_str(&rumor.content).ok()?;
    if message.v != PROTOCOL_VERSION || message.nonce.is_empty() || message.msg_type.is_empty() {
        return None;
    }

    Some((message, seal.pubkey.clone()))
}
