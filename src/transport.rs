/// Relay transport seam.
///
/// The pool talks to relays only through `RelayConnection` and
/// `RelayConnector`, so a production websocket client and the in-process
/// `MemoryRelay` are interchangeable. Relays are semi-trusted: they store
/// and forward events but authenticity is checked on our side.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MeshError;
use crate::event::{Event, Filter};

/// One item delivered on a relay subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionItem {
    Event(Event),
    /// The relay has sent everything it had stored; anything after this
    /// is live traffic.
    EndOfStored,
}

/// A live per-relay subscription. Dropping it closes the subscription.
pub struct Subscription {
    receiver: mpsc::Receiver<SubscriptionItem>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<SubscriptionItem>) -> Self {
        Self { receiver }
    }

    /// Next item, or `None` once the relay side closed the stream.
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        self.receiver.recv().await
    }
}

/// A single relay endpoint connection.
#[async_trait]
pub trait RelayConnection: Send + Sync {
    /// Address this connection was dialed with.
    fn url(&self) -> &str;

    /// Submit one event for storage and forwarding.
    async fn send(&self, event: &Event) -> Result<(), MeshError>;

    /// Open a subscription: stored matches first, then `EndOfStored`,
    /// then live matches until the subscription is dropped.
    async fn open_subscription(&self, filter: &Filter) -> Result<Subscription, MeshError>;

    /// Release the connection. Idempotent.
    async fn close(&self);
}

/// Dials relay endpoints by URL.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Arc<dyn RelayConnection>, MeshError>;
}

// ── In-process relay ───────────────────────────────────────────────────

pub mod memory {
    //! In-process relay and relay network.
    //!
    //! Backs the test suites and local simulation: a `MemoryRelay` keeps a
    //! shared event log plus a live broadcast channel, and a
    //! `MemoryRelayNetwork` hands out connections by URL, with per-URL
    //! reachability control.

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::{broadcast, mpsc};

    use super::{RelayConnection, RelayConnector, Subscription, SubscriptionItem};
    use crate::error::MeshError;
    use crate::event::{Event, Filter};

    const LIVE_CHANNEL_CAPACITY: usize = 256;
    const SUBSCRIPTION_BUFFER: usize = 64;

    struct RelayInner {
        url: String,
        stored: Mutex<Vec<Event>>,
        live: broadcast::Sender<Event>,
        /// When set, subscriptions deliver stored events but never signal
        /// `EndOfStored`, simulating a relay that strings clients along.
        withhold_eose: bool,
    }

    /// A relay that lives in this process. Cheap to clone; clones share
    /// the same event log.
    #[derive(Clone)]
    pub struct MemoryRelay {
        inner: Arc<RelayInner>,
    }

    impl MemoryRelay {
        pub fn new(url: impl Into<String>) -> Self {
            Self::build(url.into(), false)
        }

        /// A relay that never signals end-of-stored-events.
        pub fn silent(url: impl Into<String>) -> Self {
            Self::build(url.into(), true)
        }

        fn build(url: String, withhold_eose: bool) -> Self {
            let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
            Self {
                inner: Arc::new(RelayInner {
                    url,
                    stored: Mutex::new(Vec::new()),
                    live,
                    withhold_eose,
                }),
            }
        }

        /// Store an event directly, without going through `send`.
        pub fn seed(&self, event: Event) {
            self.inner.stored.lock().unwrap().push(event);
        }

        /// Snapshot of everything this relay has stored.
        pub fn stored(&self) -> Vec<Event> {
            self.inner.stored.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RelayConnection for MemoryRelay {
        fn url(&self) -> &str {
            &self.inner.url
        }

        async fn send(&self, event: &Event) -> Result<(), MeshError> {
            self.inner.stored.lock().unwrap().push(event.clone());
            // No live subscribers is fine
            let _ = self.inner.live.send(event.clone());
            Ok(())
        }

        async fn open_subscription(&self, filter: &Filter) -> Result<Subscription, MeshError> {
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            let filter = filter.clone();
            let inner = self.inner.clone();

            // Register for live traffic before snapshotting storage so no
            // event can fall between the two; duplicates are deduplicated
            // upstream by event id.
            let mut live = inner.live.subscribe();

            tokio::spawn(async move {
                let mut matches: Vec<Event> = inner
                    .stored
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|e| filter.matches(e))
                    .cloned()
                    .collect();
                if let Some(limit) = filter.limit {
                    matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                    matches.truncate(limit);
                }
                for event in matches {
                    if tx.send(SubscriptionItem::Event(event)).await.is_err() {
                        return;
                    }
                }
                if !inner.withhold_eose
                    && tx.send(SubscriptionItem::EndOfStored).await.is_err()
                {
                    return;
                }
                loop {
                    match live.recv().await {
                        Ok(event) => {
                            if filter.matches(&event)
                                && tx.send(SubscriptionItem::Event(event)).await.is_err()
                            {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            });

            Ok(Subscription::new(rx))
        }

        async fn close(&self) {}
    }

    /// A set of named in-process relays acting as the relay network.
    #[derive(Clone, Default)]
    pub struct MemoryRelayNetwork {
        relays: Arc<Mutex<HashMap<String, MemoryRelay>>>,
    }

    impl MemoryRelayNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        /// Create and register a relay reachable at `url`.
        pub fn add_relay(&self, url: &str) -> MemoryRelay {
            let relay = MemoryRelay::new(url);
            self.relays
                .lock()
                .unwrap()
                .insert(url.to_string(), relay.clone());
            relay
        }

        /// Register a pre-built relay (e.g. a silent one) at its URL.
        pub fn register(&self, relay: MemoryRelay) {
            self.relays
                .lock()
                .unwrap()
                .insert(relay.url().to_string(), relay);
        }

        /// Handle to a registered relay.
        pub fn relay(&self, url: &str) -> Option<MemoryRelay> {
            self.relays.lock().unwrap().get(url).cloned()
        }

        /// Make a URL unreachable. Dial attempts to it fail afterward.
        pub fn remove_relay(&self, url: &str) {
            self.relays.lock().unwrap().remove(url);
        }
    }

    #[async_trait]
    impl RelayConnector for MemoryRelayNetwork {
        async fn dial(&self, url: &str) -> Result<Arc<dyn RelayConnection>, MeshError> {
            let relay = self.relays.lock().unwrap().get(url).cloned();
            match relay {
                Some(relay) => Ok(Arc::new(relay)),
                None => Err(MeshError::Transport(format!("unreachable relay: {url}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{MemoryRelay, MemoryRelayNetwork};
    use super::*;
    use crate::event::{EventBuilder, KIND_CHANNEL_MESSAGE, KIND_SEAL};
    use ed25519_dalek::SigningKey;

    fn signed_event(seed: u8, kind: u32, content: &str) -> Event {
        EventBuilder::new(kind, content).sign(&SigningKey::from_bytes(&[seed; 32]))
    }

    #[tokio::test]
    async fn stored_events_then_end_of_stored() {
        let relay = MemoryRelay::new("mem://a");
        let event = signed_event(1, KIND_SEAL, "stored");
        relay.seed(event.clone());

        let mut sub = relay
            .open_subscription(&Filter::new().kind(KIND_SEAL))
            .await
            .unwrap();

        assert_eq!(sub.next().await, Some(SubscriptionItem::Event(event)));
        assert_eq!(sub.next().await, Some(SubscriptionItem::EndOfStored));
    }

    #[tokio::test]
    async fn subscription_filters_stored_events() {
        let relay = MemoryRelay::new("mem://a");
        relay.seed(signed_event(1, KIND_SEAL, "seal"));
        relay.seed(signed_event(1, KIND_CHANNEL_MESSAGE, "chat"));

        let mut sub = relay
            .open_subscription(&Filter::new().kind(KIND_CHANNEL_MESSAGE))
            .await
            .unwrap();

        match sub.next().await {
            Some(SubscriptionItem::Event(e)) => assert_eq!(e.kind, KIND_CHANNEL_MESSAGE),
            other => panic!("expected one event, got {other:?}"),
        }
        assert_eq!(sub.next().await, Some(SubscriptionItem::EndOfStored));
    }

    #[tokio::test]
    async fn live_events_delivered_after_end_of_stored() {
        let relay = MemoryRelay::new("mem://a");
        let mut sub = relay
            .open_subscription(&Filter::new().kind(KIND_SEAL))
            .await
            .unwrap();
        assert_eq!(sub.next().await, Some(SubscriptionItem::EndOfStored));

        let event = signed_event(2, KIND_SEAL, "live");
        relay.send(&event).await.unwrap();

        assert_eq!(sub.next().await, Some(SubscriptionItem::Event(event)));
    }

    #[tokio::test]
    async fn silent_relay_never_signals_end_of_stored() {
        let relay = MemoryRelay::silent("mem://tarpit");
        relay.seed(signed_event(1, KIND_SEAL, "bait"));

        let mut sub = relay.open_subscription(&Filter::new()).await.unwrap();
        assert!(matches!(
            sub.next().await,
            Some(SubscriptionItem::Event(_))
        ));

        let next = tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await;
        assert!(next.is_err(), "silent relay must not signal end of stored");
    }

    #[tokio::test]
    async fn limit_keeps_most_recent_stored() {
        let relay = MemoryRelay::new("mem://a");
        for i in 0..5u64 {
            let event = EventBuilder::new(KIND_CHANNEL_MESSAGE, format!("m{i}"))
                .created_at(1_000 + i)
                .sign(&SigningKey::from_bytes(&[9; 32]));
            relay.seed(event);
        }

        let mut sub = relay
            .open_subscription(&Filter::new().limit(2))
            .await
            .unwrap();
        let mut received = Vec::new();
        while let Some(item) = sub.next().await {
            match item {
                SubscriptionItem::Event(e) => received.push(e.created_at),
                SubscriptionItem::EndOfStored => break,
            }
        }
        assert_eq!(received.len(), 2);
        assert!(received.contains(&1_004) && received.contains(&1_003));
    }

    #[tokio::test]
    async fn network_dials_registered_relays_only() {
        let network = MemoryRelayNetwork::new();
        network.add_relay("mem://up");

        assert!(network.dial("mem://up").await.is_ok());
        assert!(matches!(
            network.dial("mem://down").await,
            Err(MeshError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn network_connections_share_the_relay_log() {
        let network = MemoryRelayNetwork::new();
        let relay = network.add_relay("mem://shared");

        let conn = network.dial("mem://shared").await.unwrap();
        conn.send(&signed_event(1, KIND_SEAL, "via connection"))
            .await
            .unwrap();

        assert_eq!(relay.stored().len(), 1);
    }
}
