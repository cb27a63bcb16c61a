/// Local persistence: inbox, peer cache, channel subscriptions.
///
/// SQLite-backed. Every write is idempotent on its natural key: inbox
/// entries by message id, peers by pubkey (last write wins on every
/// field), channels by group id (re-subscription is a no-op), so
/// re-ingesting the same remote data never duplicates local state.
use std::path::Path;

use rusqlite::{params, Connection};

use crate::error::MeshError;
use crate::event::now_ms;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS inbox (
    id            TEXT PRIMARY KEY,
    from_pubkey   TEXT NOT NULL,
    from_agent_id TEXT,
    content       TEXT NOT NULL,
    ts            INTEGER NOT NULL,
    read          INTEGER NOT NULL DEFAULT 0,
    created_at    INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS peers (
    pubkey       TEXT PRIMARY KEY,
    agent_id     TEXT,
    last_seen    INTEGER,
    capabilities TEXT,
    relays       TEXT
);
CREATE TABLE IF NOT EXISTS channels (
    group_id      TEXT PRIMARY KEY,
    is_private    INTEGER NOT NULL DEFAULT 0,
    subscribed_at INTEGER NOT NULL
);
";

/// A received direct message as persisted locally.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxMessage {
    /// Message nonce, the dedup key.
    pub id: String,
    pub from_pubkey: String,
    pub from_agent_id: Option<String>,
    pub content: String,
    /// Sender-embedded logical timestamp (ms).
    pub ts: u64,
    pub read: bool,
}

/// Inbox listing options. All default to "no restriction".
#[derive(Debug, Clone, Default)]
pub struct InboxQuery {
    pub unread_only: bool,
    pub from_agent: Option<String>,
    pub limit: Option<usize>,
}

/// Cached knowledge about another agent.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub pubkey: String,
    pub agent_id: Option<String>,
    pub last_seen: u64,
    pub capabilities: Vec<String>,
    pub relays: Vec<String>,
}

/// Local channel-subscription marker.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    pub group_id: String,
    pub private: bool,
    pub subscribed_at: u64,
}

pub struct MeshStore {
    conn: Connection,
}

impl MeshStore {
    pub fn open(path: &Path) -> Result<Self, MeshError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, MeshError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MeshError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ── Inbox ──────────────────────────────────────────────────────────

    /// Insert a message unless one with the same id exists. Returns
    /// whether the message was new.
    pub fn append_inbox_if_absent(&self, message: &InboxMessage) -> Result<bool, MeshError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO inbox (id, from_pubkey, from_agent_id, content, ts, read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                message.id,
                message.from_pubkey,
                message.from_agent_id,
                message.content,
                // Sender-supplied; clamp so it cannot go negative in SQL
                // and invert the newest-first ordering.
                i64::try_from(message.ts).unwrap_or(i64::MAX),
                now_ms() as i64,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Messages newest-first, optionally restricted.
    pub fn list_inbox(&self, query: &InboxQuery) -> Result<Vec<InboxMessage>, MeshError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, from_pubkey, from_agent_id, content, ts, read
             FROM inbox ORDER BY ts DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(InboxMessage {
                id: row.get(0)?,
                from_pubkey: row.get(1)?,
                from_agent_id: row.get(2)?,
                content: row.get(3)?,
                ts: row.get::<_, i64>(4)? as u64,
                read: row.get::<_, i64>(5)? != 0,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let message = row?;
            if query.unread_only && message.read {
                continue;
            }
            if let Some(agent) = &query.from_agent {
                if message.from_agent_id.as_deref() != Some(agent.as_str()) {
                    continue;
                }
            }
            messages.push(message);
            if query.limit.is_some_and(|limit| messages.len() >= limit) {
                break;
            }
        }
        Ok(messages)
    }

    /// Mark one message read. Returns whether it existed.
    pub fn mark_read(&self, id: &str) -> Result<bool, MeshError> {
        let updated = self
            .conn
            .execute("UPDATE inbox SET read = 1 WHERE id = ?1", params![id])?;
        Ok(updated > 0)
    }

    pub fn unread_count(&self) -> Result<usize, MeshError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM inbox WHERE read = 0", [], |row| {
                    row.get(0)
                })?;
        Ok(count as usize)
    }

    // ── Peers ──────────────────────────────────────────────────────────

    /// Insert or fully replace the record for a pubkey.
    pub fn upsert_peer(&self, peer: &PeerRecord) -> Result<(), MeshError> {
        let capabilities = serde_json::to_string(&peer.capabilities)?;
        let relays = serde_json::to_string(&peer.relays)?;
        self.conn.execute(
            "INSERT INTO peers (pubkey, agent_id, last_seen, capabilities, relays)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(pubkey) DO UPDATE SET
                 agent_id = excluded.agent_id,
                 last_seen = excluded.last_seen,
                 capabilities = excluded.capabilities,
                 relays = excluded.relays",
            params![
                peer.pubkey,
                peer.agent_id,
                peer.last_seen as i64,
                capabilities,
                relays,
            ],
        )?;
        Ok(())
    }

    /// All cached peers, most recently seen first.
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>, MeshError> {
        let mut stmt = self.conn.prepare(
            "SELECT pubkey, agent_id, last_seen, capabilities, relays
             FROM peers ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PeerRecord {
                pubkey: row.get(0)?,
                agent_id: row.get(1)?,
                last_seen: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                capabilities: decode_list(row.get::<_, Option<String>>(3)?),
                relays: decode_list(row.get::<_, Option<String>>(4)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn peer_by_agent_id(&self, agent_id: &str) -> Result<Option<PeerRecord>, MeshError> {
        Ok(self
            .list_peers()?
            .into_iter()
            .find(|p| p.agent_id.as_deref() == Some(agent_id)))
    }

    // ── Channels ───────────────────────────────────────────────────────

    /// Record a channel subscription; repeating it is a no-op that keeps
    /// the original `subscribed_at`.
    pub fn upsert_channel(&self, group_id: &str, private: bool) -> Result<(), MeshError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO channels (group_id, is_private, subscribed_at)
             VALUES (?1, ?2, ?3)",
            params![group_id, private as i64, now_ms() as i64],
        )?;
        Ok(())
    }

    pub fn list_channels(&self) -> Result<Vec<ChannelRecord>, MeshError> {
        let mut stmt = self
            .conn
            .prepare("SELECT group_id, is_private, subscribed_at FROM channels ORDER BY group_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(ChannelRecord {
                group_id: row.get(0)?,
                private: row.get::<_, i64>(1)? != 0,
                subscribed_at: row.get::<_, i64>(2)? as u64,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn decode_list(column: Option<String>) -> Vec<String> {
    column
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}
