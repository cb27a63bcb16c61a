/// Runtime configuration, loaded from a JSON file with tolerant fallback.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Public relays used when no configuration overrides them.
pub const DEFAULT_RELAYS: [&str; 4] = [
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
    "wss://relay.nostr.band",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
}

fn default_relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect()
}

fn default_query_timeout_secs() -> u64 {
    5
}

fn default_scan_timeout_secs() -> u64 {
    10
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            relays: default_relays(),
            query_timeout_secs: default_query_timeout_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
        }
    }
}

impl MeshConfig {
    /// Load from `path`. A missing or unparseable file yields the
    /// defaults; agents must come up even with a damaged config.
    pub fn load(path: &Path) -> Self {
        let Ok(json) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&json) {
            Ok(config) => config,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unparseable config");
                Self::default()
            }
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }
}
