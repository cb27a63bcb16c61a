/// Agent directory: self-announcement and lookup.
///
/// Each agent keeps one replaceable mapping record per agent id on the
/// network. Different relays can hold different generations of it, so
/// every read reconciles with freshness-wins: the record with the
/// greatest `created_at` is the current one, regardless of which relay
/// served it. Unparseable records are dropped rather than failing the
/// whole read, so one hostile relay cannot blank the directory.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MeshError;
use crate::event::{Event, EventBuilder, Filter, KIND_DIRECTORY, PROTOCOL_VERSION};
use crate::identity::Identity;
use crate::pool::{PublishOutcome, RelayPool, QUERY_TIMEOUT, SCAN_TIMEOUT};
use crate::store::{MeshStore, PeerRecord};

/// JSON body of a mapping record.
#[derive(Debug, Serialize, Deserialize)]
struct MappingContent {
    v: u32,
    agent_id: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

/// One reconciled directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRecord {
    pub agent_id: String,
    pub pubkey: String,
    pub capabilities: Vec<String>,
    /// Relays the agent said it monitors.
    pub relays: Vec<String>,
    /// `created_at` of the mapping record, used as the freshness key.
    pub registered_at: u64,
}

/// Directory scan options.
#[derive(Debug, Clone, Default)]
pub struct DirectoryQuery {
    /// Keep only agent ids starting with this prefix.
    pub prefix: Option<String>,
    /// Cap the result list (applied after the prefix filter).
    pub limit: Option<usize>,
}

/// A page of directory results. `total` counts every agent on the
/// network before prefix/limit were applied, so callers can tell
/// "filtered down" from "network only has N agents".
#[derive(Debug, Clone)]
pub struct DirectoryPage {
    pub agents: Vec<AgentRecord>,
    pub total: usize,
}

/// Publish this identity's mapping record, tagged with every relay the
/// pool is currently connected to.
pub async fn register(
    pool: &RelayPool,
    identity: &Identity,
    capabilities: &[String],
) -> Result<PublishOutcome, MeshError> {
    let content = serde_json::to_string(&MappingContent {
        v: PROTOCOL_VERSION,
        agent_id: identity.agent_id.clone(),
        capabilities: capabilities.to_vec(),
    })?;

    let mut builder =
        EventBuilder::new(KIND_DIRECTORY, content).tag(["d", identity.agent_id.as_str()]);
    for url in pool.connected() {
        builder = builder.tag(["relay", url.as_str()]);
    }
    let event = builder.sign(&identity.signing_key());

    pool.publish(&event).await
}

/// Look up one agent id. When several generations of the record exist
/// across relays, the freshest wins. `None` when no valid record exists.
pub async fn lookup_one(
    pool: &RelayPool,
    agent_id: &str,
) -> Result<Option<AgentRecord>, MeshError> {
    let filter = Filter::new().kind(KIND_DIRECTORY).d_tag(agent_id);
    let events = pool.query(&filter, QUERY_TIMEOUT).await?;

    Ok(events
        .iter()
        .filter_map(parse_record)
        .filter(|record| record.agent_id == agent_id)
        .max_by_key(|record| record.registered_at))
}

/// `lookup_one` for callers that need a hard failure on absence.
pub async fn resolve(pool: &RelayPool, agent_id: &str) -> Result<AgentRecord, MeshError> {
    lookup_one(pool, agent_id)
        .await?
        .ok_or_else(|| MeshError::NotFound {
            agent_id: agent_id.to_string(),
        })
}

/// Full directory scan: reconcile every mapping record on the network,
/// apply the prefix filter then the cap, and refresh the local peer
/// cache with the returned agents.
pub async fn lookup_all(
    pool: &RelayPool,
    store: &MeshStore,
    query: &DirectoryQuery,
) -> Result<DirectoryPage, MeshError> {
    let events = pool
        .query(&Filter::new().kind(KIND_DIRECTORY), SCAN_TIMEOUT)
        .await?;

    // Freshness-wins merge per agent id
    let mut freshest: HashMap<String, AgentRecord> = HashMap::new();
    for record in events.iter().filter_map(parse_record) {
        match freshest.get(&record.agent_id) {
            Some(current) if current.registered_at >= record.registered_at => {}
            _ => {
                freshest.insert(record.agent_id.clone(), record);
            }
        }
    }

    let mut agents: Vec<AgentRecord> = freshest.into_values().collect();
    let total = agents.len();

    if let Some(prefix) = &query.prefix {
        agents.retain(|a| a.agent_id.starts_with(prefix.as_str()));
    }
    agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    if let Some(limit) = query.limit {
        agents.truncate(limit);
    }

    let now = crate::event::now_secs();
    for agent in &agents {
        store.upsert_peer(&PeerRecord {
            pubkey: agent.pubkey.clone(),
            agent_id: Some(agent.agent_id.clone()),
            last_seen: now,
            capabilities: agent.capabilities.clone(),
            relays: agent.relays.clone(),
        })?;
    }

    Ok(DirectoryPage { agents, total })
}

/// Defensive parse of one mapping event. Bad JSON, wrong version, or an
/// empty agent id yields `None`.
fn parse_record(event: &Event) -> Option<AgentRecord> {
    let content: MappingContent = match serde_json::from_str(&event.content) {
        Ok(content) => content,
        Err(err) => {
            debug!(event = %event.id, error = %err, "dropping unparseable mapping record");
            return None;
        }
    };
    if content.v != PROTOCOL_VERSION || content.agent_id.is_empty() {
        return None;
    }

    Some(AgentRecord {
        agent_id: content.agent_id,
        pubkey: event.pubkey.clone(),
        capabilities: content.capabilities,
        relays: event
            .tag_values("relay")
            .into_iter()
            .map(str::to_string)
            .collect(),
        registered_at: event.created_at,
    })
}
