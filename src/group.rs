/// Public group channels.
///
/// A channel is anchored by a root event whose `d` tag is the group id;
/// messages reference the root with an `e` tag. Roots are first come,
/// first served: when concurrent creates leave multiple roots on the
/// network, every reader deterministically picks the one with the
/// lexicographically smallest event id, so the channel converges without
/// coordination.
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MeshError;
use crate::event::{
    now_ms, Event, EventBuilder, Filter, KIND_CHANNEL_CREATE, KIND_CHANNEL_MESSAGE,
    PROTOCOL_VERSION,
};
use crate::identity::Identity;
use crate::messaging::{MeshMessage, MessagePayload};
use crate::pool::{RelayPool, QUERY_TIMEOUT};
use crate::store::{ChannelRecord, MeshStore};

/// JSON body of a channel root event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub name: String,
    #[serde(default)]
    pub about: String,
}

/// One decoded channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    /// Event id of the message.
    pub id: String,
    pub group_id: String,
    /// Author pubkey. Channel posts are signed in the clear.
    pub pubkey: String,
    /// Author agent id when the post carried a structured payload.
    pub agent_id: Option<String>,
    pub text: String,
    /// Logical timestamp in milliseconds.
    pub ts: u64,
}

/// Outcome of a channel write.
#[derive(Debug, Clone)]
pub struct ChannelReceipt {
    pub event_id: String,
    pub accepted_by: Vec<String>,
}

impl ChannelReceipt {
    pub fn delivered(&self) -> bool {
        !self.accepted_by.is_empty()
    }
}

/// Publish a root event for `group_id` and record the local subscription.
pub async fn create_channel(
    pool: &RelayPool,
    store: &MeshStore,
    identity: &Identity,
    group_id: &str,
    name: &str,
    about: Option<&str>,
) -> Result<ChannelReceipt, MeshError> {
    let metadata = ChannelMetadata {
        name: name.to_string(),
        about: about
            .map(str::to_string)
            .unwrap_or_else(|| format!("agentmesh channel: {group_id}")),
    };
    let event = EventBuilder::new(KIND_CHANNEL_CREATE, serde_json::to_string(&metadata)?)
        .tag(["d", group_id])
        .sign(&identity.signing_key());

    let outcome = pool.publish(&event).await?;
    if outcome.delivered() {
        store.upsert_channel(group_id, false)?;
    }
    Ok(ChannelReceipt {
        event_id: event.id,
        accepted_by: outcome.accepted,
    })
}

/// Find the root event id for a group, or `None` when no channel exists.
///
/// Ties between duplicate roots break toward the smallest event id.
pub async fn resolve_root(
    pool: &RelayPool,
    group_id: &str,
) -> Result<Option<String>, MeshError> {
    let filter = Filter::new().kind(KIND_CHANNEL_CREATE).d_tag(group_id);
    let roots = pool.query(&filter, QUERY_TIMEOUT).await?;
    Ok(roots.into_iter().map(|e| e.id).min())
}

/// Post a message to a channel, creating the channel on the fly when no
/// root exists yet.
pub async fn post_to_channel(
    pool: &RelayPool,
    store: &MeshStore,
    identity: &Identity,
    group_id: &str,
    text: &str,
) -> Result<ChannelReceipt, MeshError> {
    let root = match resolve_root(pool, group_id).await? {
        Some(root) => root,
        None => {
            debug!(group_id, "no channel root found, creating one");
            let receipt = create_channel(pool, store, identity, group_id, group_id, None).await?;
            receipt.event_id
        }
    };

    let message = MeshMessage {
        v: PROTOCOL_VERSION,
        msg_type: "group".into(),
        from_agent: identity.agent_id.clone(),
        to_agent: None,
        payload: MessagePayload { text: text.into() },
        nonce: uuid::Uuid::new_v4().to_string(),
        ts: now_ms(),
    };
    let event = EventBuilder::new(KIND_CHANNEL_MESSAGE, serde_json::to_string(&message)?)
        .tag(["e", root.as_str(), "", "root"])
        .sign(&identity.signing_key());

    let outcome = pool.publish(&event).await?;
    if outcome.delivered() {
        store.upsert_channel(group_id, false)?;
    }
    Ok(ChannelReceipt {
        event_id: event.id,
        accepted_by: outcome.accepted,
    })
}

/// Fetch up to `limit` channel messages, oldest first.
///
/// An absent channel yields an empty list rather than an error; callers
/// cannot tell an empty channel from a missing one and rarely care.
pub async fn fetch_channel_messages(
    pool: &RelayPool,
    group_id: &str,
    limit: usize,
) -> Result<Vec<ChannelMessage>, MeshError> {
    let Some(root) = resolve_root(pool, group_id).await? else {
        return Ok(Vec::new());
    };

    let filter = Filter::new()
        .kind(KIND_CHANNEL_MESSAGE)
        .e_tag(root)
        .limit(limit);
    let events = pool.query(&filter, QUERY_TIMEOUT).await?;

    let mut messages: Vec<ChannelMessage> = events
        .iter()
        .map(|event| decode_channel_message(event, group_id))
        .collect();
    messages.sort_by_key(|m| m.ts);
    messages.truncate(limit);
    Ok(messages)
}

/// Record a local subscription without publishing anything.
pub fn subscribe_channel(store: &MeshStore, group_id: &str) -> Result<(), MeshError> {
    store.upsert_channel(group_id, false)
}

/// Channels this agent has joined, by group id.
pub fn subscribed_channels(store: &MeshStore) -> Result<Vec<ChannelRecord>, MeshError> {
    store.list_channels()
}

/// Decode one channel event. Structured payloads carry the author agent
/// id and a millisecond timestamp; anything else is kept as plain text so
/// foreign posts still show up.
fn decode_channel_message(event: &Event, group_id: &str) -> ChannelMessage {
    match serde_json::from_str::<MeshMessage>(&event.content) {
        Ok(message) if message.v == PROTOCOL_VERSION => ChannelMessage {
            id: event.id.clone(),
            group_id: group_id.to_string(),
            pubkey: event.pubkey.clone(),
            agent_id: Some(message.from_agent),
            text: message.payload.text,
            ts: message.ts,
        },
        _ => ChannelMessage {
            id: event.id.clone(),
            group_id: group_id.to_string(),
            pubkey: event.pubkey.clone(),
            agent_id: None,
            text: event.content.clone(),
            // created_at is signer-chosen and can be anything
            ts: event.created_at.saturating_mul(1000),
        },
    }
}
