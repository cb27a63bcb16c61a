/// Error taxonomy for the mesh protocol layer.
///
/// Per-endpoint relay failures are absorbed into outcome lists and never
/// surface here; only pool exhaustion and caller misuse escalate.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("no usable relay endpoints")]
    NoConnection,

    #[error("no directory record found for agent: {agent_id}")]
    NotFound { agent_id: String },

    #[error("malformed remote data: {reason}")]
    MalformedRemoteData { reason: String },

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("subscription timed out before end of stored events")]
    Timeout,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("local store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid agent id: {0}")]
    InvalidAgentId(String),
}
