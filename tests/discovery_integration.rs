/// Integration tests: directory registration and lookup across relays.
use std::sync::Arc;

use agentmesh::event::{EventBuilder, KIND_DIRECTORY};
use agentmesh::transport::memory::MemoryRelayNetwork;
use agentmesh::{discovery, DirectoryQuery, Identity, MeshError, MeshStore, RelayPool};

async fn pool(network: &MemoryRelayNetwork, urls: &[&str]) -> RelayPool {
    for url in urls {
        if network.relay(url).is_none() {
            network.add_relay(url);
        }
    }
    let urls: Vec<String> = urls.iter().map(|s| s.to_string()).collect();
    RelayPool::connect(Arc::new(network.clone()), &urls).await
}

fn identity(seed: u8, agent_id: &str) -> Identity {
    Identity::from_seed([seed; 32], agent_id).unwrap()
}

#[tokio::test]
async fn register_then_lookup() {
    let network = MemoryRelayNetwork::new();
    let shared = pool(&network, &["mem://a", "mem://b"]).await;

    let atlas = identity(1, "atlas");
    let outcome = discovery::register(&shared, &atlas, &["chat".to_string()])
        .await
        .unwrap();
    assert!(outcome.delivered());

    let record = discovery::resolve(&shared, "atlas").await.unwrap();
    assert_eq!(record.agent_id, "atlas");
    assert_eq!(record.pubkey, atlas.public_key);
    assert_eq!(record.capabilities, vec!["chat"]);
    // The record advertises every relay the registering pool held.
    assert_eq!(record.relays.len(), 2);
}

#[tokio::test]
async fn lookup_unknown_agent() {
    let network = MemoryRelayNetwork::new();
    let shared = pool(&network, &["mem://a"]).await;

    assert!(discovery::lookup_one(&shared, "ghost")
        .await
        .unwrap()
        .is_none());
    assert!(matches!(
        discovery::resolve(&shared, "ghost").await,
        Err(MeshError::NotFound { agent_id }) if agent_id == "ghost"
    ));
}

#[tokio::test]
async fn freshest_record_wins_across_relays() {
    // Relay a holds a stale generation of the mapping, relay b a newer
    // one. Lookup must reconcile to the newer one regardless of order.
    let network = MemoryRelayNetwork::new();
    let relay_a = network.add_relay("mem://a");
    let relay_b = network.add_relay("mem://b");

    let atlas = identity(1, "atlas");
    let record = |capabilities: &str, created_at: u64| {
        EventBuilder::new(
            KIND_DIRECTORY,
            format!(r#"{{"v":1,"agent_id":"atlas","capabilities":["{capabilities}"]}}"#),
        )
        .tag(["d", "atlas"])
        .created_at(created_at)
        .sign(&atlas.signing_key())
    };
    relay_a.seed(record("old", 100));
    relay_b.seed(record("new", 200));

    let shared = pool(&network, &["mem://a", "mem://b"]).await;
    let resolved = discovery::resolve(&shared, "atlas").await.unwrap();
    assert_eq!(resolved.capabilities, vec!["new"]);
    assert_eq!(resolved.registered_at, 200);
}

#[tokio::test]
async fn malformed_records_do_not_poison_the_directory() {
    let network = MemoryRelayNetwork::new();
    let relay = network.add_relay("mem://a");

    // A hostile relay can store whatever it likes under the right kind.
    let mallory = identity(9, "mallory");
    relay.seed(
        EventBuilder::new(KIND_DIRECTORY, "{{{garbage")
            .tag(["d", "atlas"])
            .sign(&mallory.signing_key()),
    );

    let shared = pool(&network, &["mem://a"]).await;
    let atlas = identity(1, "atlas");
    discovery::register(&shared, &atlas, &[]).await.unwrap();

    let resolved = discovery::resolve(&shared, "atlas").await.unwrap();
    assert_eq!(resolved.pubkey, atlas.public_key);
}

#[tokio::test]
async fn directory_scan_with_prefix_and_limit() {
    let network = MemoryRelayNetwork::new();
    let shared = pool(&network, &["mem://a"]).await;
    let store = MeshStore::open_in_memory().unwrap();

    for (seed, agent_id) in [(1, "web-alpha"), (2, "web-beta"), (3, "db-gamma")] {
        let agent = identity(seed, agent_id);
        discovery::register(&shared, &agent, &[]).await.unwrap();
    }

    let page = discovery::lookup_all(
        &shared,
        &store,
        &DirectoryQuery {
            prefix: Some("web-".into()),
            limit: Some(1),
        },
    )
    .await
    .unwrap();

    // total counts the whole network, not the filtered page
    assert_eq!(page.total, 3);
    assert_eq!(page.agents.len(), 1);
    assert_eq!(page.agents[0].agent_id, "web-alpha");
}

#[tokio::test]
async fn scan_refreshes_the_peer_cache() {
    let network = MemoryRelayNetwork::new();
    let shared = pool(&network, &["mem://a"]).await;
    let store = MeshStore::open_in_memory().unwrap();

    let atlas = identity(1, "atlas");
    discovery::register(&shared, &atlas, &["chat".to_string()])
        .await
        .unwrap();

    discovery::lookup_all(&shared, &store, &DirectoryQuery::default())
        .await
        .unwrap();

    let cached = store
        .peer_by_agent_id("atlas")
        .unwrap()
        .expect("peer cached after scan");
    assert_eq!(cached.pubkey, atlas.public_key);
    assert_eq!(cached.capabilities, vec!["chat"]);
}

#[tokio::test]
async fn reregistration_supersedes() {
    let network = MemoryRelayNetwork::new();
    let shared = pool(&network, &["mem://a"]).await;
    let relay = network.relay("mem://a").unwrap();

    let atlas = identity(1, "atlas");
    discovery::register(&shared, &atlas, &["v1".to_string()])
        .await
        .unwrap();

    // Second generation, strictly newer than anything stored so far.
    let newest = relay
        .stored()
        .iter()
        .map(|e| e.created_at)
        .max()
        .unwrap();
    relay.seed(
        EventBuilder::new(
            KIND_DIRECTORY,
            r#"{"v":1,"agent_id":"atlas","capabilities":["v2"]}"#,
        )
        .tag(["d", "atlas"])
        .created_at(newest + 10)
        .sign(&atlas.signing_key()),
    );

    let resolved = discovery::resolve(&shared, "atlas").await.unwrap();
    assert_eq!(resolved.capabilities, vec!["v2"]);
}
