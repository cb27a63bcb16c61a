/// Relay pool: fan-out across many independent, unreliable endpoints.
///
/// Every operation runs against all connected endpoints concurrently and
/// settles them all before returning; a failing endpoint contributes
/// nothing and is recorded, never propagated. The only escalated failure
/// is having zero usable endpoints. Events aggregated from relays are
/// signature-verified and deduplicated by id before callers see them.
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::MeshError;
use crate::event::{Event, Filter};
use crate::transport::{RelayConnection, RelayConnector, SubscriptionItem};

/// Default timeout for targeted lookups.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Default timeout for full-directory scans and inbox fetches.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

const SUBSCRIPTION_BUFFER: usize = 64;

/// Per-endpoint result lists for a publish. Overall success criterion is
/// "accepted is nonempty", not unanimity.
#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

impl PublishOutcome {
    pub fn delivered(&self) -> bool {
        !self.accepted.is_empty()
    }
}

/// A point-in-time set of relay connections, owned by its creator.
///
/// Lifetime is one logical operation: connect, use, close. Failed
/// endpoints are never retried within a pool's lifetime.
pub struct RelayPool {
    connections: Vec<Arc<dyn RelayConnection>>,
    connected: Vec<String>,
    failed: Vec<String>,
}

impl RelayPool {
    /// Dial every URL concurrently; each attempt succeeds or fails on its
    /// own and the call returns once all have settled. An empty connected
    /// set is reported, not raised; the caller decides whether to
    /// proceed degraded.
    pub async fn connect(connector: Arc<dyn RelayConnector>, urls: &[String]) -> RelayPool {
        let mut attempts = JoinSet::new();
        for url in urls {
            let connector = connector.clone();
            let url = url.clone();
            attempts.spawn(async move {
                let result = connector.dial(&url).await;
                (url, result)
            });
        }

        let mut pool = RelayPool {
            connections: Vec::new(),
            connected: Vec::new(),
            failed: Vec::new(),
        };
        while let Some(joined) = attempts.join_next().await {
            let Ok((url, result)) = joined else { continue };
            match result {
                Ok(connection) => {
                    debug!(relay = %url, "connected");
                    pool.connections.push(connection);
                    pool.connected.push(url);
                }
                Err(err) => {
                    warn!(relay = %url, error = %err, "connection failed");
                    pool.failed.push(url);
                }
            }
        }
        pool
    }

    /// Endpoints that accepted the connection.
    pub fn connected(&self) -> &[String] {
        &self.connected
    }

    /// Endpoints that could not be reached.
    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send `event` to every connected endpoint; settle all sends before
    /// returning per-endpoint acceptance lists.
    pub async fn publish(&self, event: &Event) -> Result<PublishOutcome, MeshError> {
        if self.connections.is_empty() {
            return Err(MeshError::NoConnection);
        }

        let mut sends = JoinSet::new();
        for connection in &self.connections {
            let connection = connection.clone();
            let event = event.clone();
            sends.spawn(async move {
                let url = connection.url().to_string();
                match connection.send(&event).await {
                    Ok(()) => (url, true),
                    Err(err) => {
                        warn!(relay = %url, error = %err, "publish rejected");
                        (url, false)
                    }
                }
            });
        }

        let mut outcome = PublishOutcome::default();
        while let Some(joined) = sends.join_next().await {
            let Ok((url, accepted)) = joined else { continue };
            if accepted {
                outcome.accepted.push(url);
            } else {
                outcome.rejected.push(url);
            }
        }
        Ok(outcome)
    }

    /// Query every endpoint with the same filter and union the results.
    ///
    /// Each endpoint terminates on its end-of-stored-events signal or when
    /// `timeout` elapses, whichever comes first; a timed-out endpoint
    /// still contributes whatever it produced. Results carry no ordering
    /// guarantee.
    pub async fn query(
        &self,
        filter: &Filter,
        timeout: Duration,
    ) -> Result<Vec<Event>, MeshError> {
        if self.connections.is_empty() {
            return Err(MeshError::NoConnection);
        }

        let mut queries = JoinSet::new();
        for connection in &self.connections {
            let connection = connection.clone();
            let filter = filter.clone();
            queries.spawn(collect_stored(connection, filter, timeout));
        }

        let mut by_id: HashMap<String, Event> = HashMap::new();
        while let Some(joined) = queries.join_next().await {
            let Ok((url, events, failure)) = joined else { continue };
            match failure {
                Some(MeshError::Timeout) => {
                    warn!(relay = %url, "query timed out, keeping partial results")
                }
                Some(err) => warn!(relay = %url, error = %err, "query failed"),
                None => {}
            }
            for event in events {
                // Insert-if-absent union: ids are content-derived, so the
                // same event from two relays is byte-identical.
                by_id.entry(event.id.clone()).or_insert(event);
            }
        }
        Ok(by_id.into_values().collect())
    }

    /// Long-lived merged subscription across all endpoints.
    ///
    /// Events are verified and deduplicated by id for the lifetime of the
    /// subscription. Cancel (or drop) stops new deliveries and closes
    /// every underlying endpoint subscription; items already queued may
    /// still be delivered once.
    pub async fn subscribe(&self, filter: &Filter) -> Result<PoolSubscription, MeshError> {
        if self.connections.is_empty() {
            return Err(MeshError::NoConnection);
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks = JoinSet::new();
        for connection in &self.connections {
            tasks.spawn(forward_live(
                connection.clone(),
                filter.clone(),
                tx.clone(),
                seen.clone(),
            ));
        }
        Ok(PoolSubscription {
            receiver: rx,
            tasks,
        })
    }

    /// Release every live connection. Consuming the pool makes reuse and
    /// double-close impossible.
    pub async fn close(self) {
        for connection in &self.connections {
            connection.close().await;
        }
    }
}

/// Drain one endpoint's subscription until end-of-stored-events, stream
/// close, or timeout. Unverifiable events are dropped here so callers
/// never see them.
async fn collect_stored(
    connection: Arc<dyn RelayConnection>,
    filter: Filter,
    timeout: Duration,
) -> (String, Vec<Event>, Option<MeshError>) {
    let url = connection.url().to_string();
    let mut events = Vec::new();

    let mut subscription = match connection.open_subscription(&filter).await {
        Ok(subscription) => subscription,
        Err(err) => return (url, events, Some(err)),
    };

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, subscription.next()).await {
            Err(_) => return (url, events, Some(MeshError::Timeout)),
            Ok(None) | Ok(Some(SubscriptionItem::EndOfStored)) => return (url, events, None),
            Ok(Some(SubscriptionItem::Event(event))) => match event.verify() {
                Ok(()) => events.push(event),
                Err(err) => {
                    debug!(relay = %url, event = %event.id, error = %err, "dropping unverifiable event")
                }
            },
        }
    }
}

/// Forward one endpoint's live traffic into the merged channel,
/// deduplicating against ids seen anywhere in the pool subscription.
async fn forward_live(
    connection: Arc<dyn RelayConnection>,
    filter: Filter,
    tx: mpsc::Sender<Event>,
    seen: Arc<Mutex<HashSet<String>>>,
) {
    let url = connection.url().to_string();
    let mut subscription = match connection.open_subscription(&filter).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(relay = %url, error = %err, "subscription failed");
            return;
        }
    };

    while let Some(item) = subscription.next().await {
        let SubscriptionItem::Event(event) = item else {
            continue;
        };
        if let Err(err) = event.verify() {
            debug!(relay = %url, event = %event.id, error = %err, "dropping unverifiable event");
            continue;
        }
        let fresh = seen.lock().unwrap().insert(event.id.clone());
        if fresh && tx.send(event).await.is_err() {
            // Receiver dropped, subscription cancelled.
            return;
        }
    }
}

/// Handle for a live pool-wide subscription: a merged, deduplicated event
/// stream plus cancellation. Dropping the handle aborts all endpoint
/// tasks.
pub struct PoolSubscription {
    receiver: mpsc::Receiver<Event>,
    tasks: JoinSet<()>,
}

impl PoolSubscription {
    /// Next deduplicated event, or `None` after every endpoint stream
    /// ended.
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Stop all endpoint subscriptions. Safe to call at any time,
    /// including before any event arrived.
    pub fn cancel(mut self) {
        self.tasks.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBuilder, KIND_CHANNEL_MESSAGE, KIND_SEAL};
    use crate::transport::memory::MemoryRelayNetwork;
    use ed25519_dalek::SigningKey;

    fn signed_event(seed: u8, kind: u32, content: &str) -> Event {
        EventBuilder::new(kind, content).sign(&SigningKey::from_bytes(&[seed; 32]))
    }

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn pool_of(network: &MemoryRelayNetwork, list: &[&str]) -> RelayPool {
        RelayPool::connect(Arc::new(network.clone()), &urls(list)).await
    }

    #[tokio::test]
    async fn connect_partitions_connected_and_failed() {
        let network = MemoryRelayNetwork::new();
        network.add_relay("mem://a");
        network.add_relay("mem://b");

        let pool = pool_of(&network, &["mem://a", "mem://b", "mem://down"]).await;

        assert_eq!(pool.connected().len(), 2);
        assert_eq!(pool.failed(), &["mem://down".to_string()]);
        assert!(!pool.is_empty());
    }

    #[tokio::test]
    async fn connect_with_all_failures_is_not_an_error() {
        let network = MemoryRelayNetwork::new();
        let pool = pool_of(&network, &["mem://x", "mem://y"]).await;
        assert!(pool.is_empty());
        assert_eq!(pool.failed().len(), 2);
    }

    #[tokio::test]
    async fn publish_reports_per_endpoint_acceptance() {
        let network = MemoryRelayNetwork::new();
        let a = network.add_relay("mem://a");
        let b = network.add_relay("mem://b");
        let pool = pool_of(&network, &["mem://a", "mem://b"]).await;

        let event = signed_event(1, KIND_SEAL, "payload");
        let outcome = pool.publish(&event).await.unwrap();

        assert!(outcome.delivered());
        assert_eq!(outcome.accepted.len(), 2);
        assert!(outcome.rejected.is_empty());
        assert_eq!(a.stored().len(), 1);
        assert_eq!(b.stored().len(), 1);
    }

    #[tokio::test]
    async fn publish_on_empty_pool_is_no_connection() {
        let network = MemoryRelayNetwork::new();
        let pool = pool_of(&network, &["mem://down"]).await;

        let event = signed_event(1, KIND_SEAL, "payload");
        assert!(matches!(
            pool.publish(&event).await,
            Err(MeshError::NoConnection)
        ));
    }

    #[tokio::test]
    async fn query_unions_and_dedups_across_relays() {
        let network = MemoryRelayNetwork::new();
        let a = network.add_relay("mem://a");
        let b = network.add_relay("mem://b");

        let shared = signed_event(1, KIND_SEAL, "on both");
        let only_b = signed_event(2, KIND_SEAL, "only b");
        a.seed(shared.clone());
        b.seed(shared.clone());
        b.seed(only_b.clone());

        let pool = pool_of(&network, &["mem://a", "mem://b"]).await;
        let events = pool
            .query(&Filter::new().kind(KIND_SEAL), QUERY_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        let ids: HashSet<_> = events.iter().map(|e| e.id.clone()).collect();
        assert!(ids.contains(&shared.id) && ids.contains(&only_b.id));
    }

    #[tokio::test]
    async fn query_drops_unverifiable_events() {
        let network = MemoryRelayNetwork::new();
        let relay = network.add_relay("mem://a");

        let good = signed_event(1, KIND_SEAL, "good");
        let mut forged = signed_event(2, KIND_SEAL, "forged");
        forged.content = "tampered after signing".into();
        relay.seed(good.clone());
        relay.seed(forged);

        let pool = pool_of(&network, &["mem://a"]).await;
        let events = pool
            .query(&Filter::new().kind(KIND_SEAL), QUERY_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, good.id);
    }

    #[tokio::test]
    async fn query_timeout_bounds_a_silent_relay() {
        use crate::transport::memory::MemoryRelay;

        let network = MemoryRelayNetwork::new();
        let tarpit = MemoryRelay::silent("mem://tarpit");
        tarpit.seed(signed_event(1, KIND_SEAL, "partial"));
        network.register(tarpit);

        let pool = pool_of(&network, &["mem://tarpit"]).await;
        let timeout = Duration::from_millis(100);

        let started = std::time::Instant::now();
        let events = pool
            .query(&Filter::new().kind(KIND_SEAL), timeout)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        // Partial results survive the timeout
        assert_eq!(events.len(), 1);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn query_on_empty_pool_is_no_connection() {
        let network = MemoryRelayNetwork::new();
        let pool = pool_of(&network, &[]).await;
        assert!(matches!(
            pool.query(&Filter::new(), QUERY_TIMEOUT).await,
            Err(MeshError::NoConnection)
        ));
    }

    #[tokio::test]
    async fn subscribe_delivers_live_events_once() {
        let network = MemoryRelayNetwork::new();
        let a = network.add_relay("mem://a");
        let b = network.add_relay("mem://b");
        let pool = pool_of(&network, &["mem://a", "mem://b"]).await;

        let mut subscription = pool
            .subscribe(&Filter::new().kind(KIND_CHANNEL_MESSAGE))
            .await
            .unwrap();

        // Same event reaches the pool from both relays
        let event = signed_event(1, KIND_CHANNEL_MESSAGE, "live");
        a.send(&event).await.unwrap();
        b.send(&event).await.unwrap();

        let first = subscription.next().await.expect("one delivery");
        assert_eq!(first.id, event.id);

        let second =
            tokio::time::timeout(Duration::from_millis(50), subscription.next()).await;
        assert!(second.is_err(), "duplicate must not be delivered");
    }

    #[tokio::test]
    async fn subscription_cancel_is_safe_before_any_event() {
        let network = MemoryRelayNetwork::new();
        network.add_relay("mem://a");
        let pool = pool_of(&network, &["mem://a"]).await;

        let subscription = pool.subscribe(&Filter::new()).await.unwrap();
        subscription.cancel();
    }

    #[tokio::test]
    async fn subscription_stops_after_cancel() {
        let network = MemoryRelayNetwork::new();
        let relay = network.add_relay("mem://a");
        let pool = pool_of(&network, &["mem://a"]).await;

        let subscription = pool
            .subscribe(&Filter::new().kind(KIND_SEAL))
            .await
            .unwrap();
        subscription.cancel();

        // Delivery after cancellation must not panic anything
        relay.send(&signed_event(1, KIND_SEAL, "late")).await.unwrap();
    }

    #[tokio::test]
    async fn close_releases_connections() {
        let network = MemoryRelayNetwork::new();
        network.add_relay("mem://a");
        let pool = pool_of(&network, &["mem://a", "mem://down"]).await;
        pool.close().await;
    }
}
