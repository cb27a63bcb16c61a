//! agentmesh: decentralized agent-to-agent communication over public relays.
//!
//! Agents hold Ed25519 identities, announce themselves through replaceable
//! directory records, exchange private messages via a three-layer encrypted
//! envelope, and share public group channels. Every network operation fans
//! out across a relay pool and reconciles whatever subset answers, so no
//! single relay is trusted for availability or integrity.
//!
//! The layers, bottom up:
//! - [`event`]: signed content-addressed events and subscription filters
//! - [`crypto`]: conversation keys and authenticated encryption
//! - [`transport`] / [`pool`]: relay connections and fan-out
//! - [`identity`] / [`store`] / [`config`]: local state
//! - [`discovery`], [`messaging`], [`group`]: the protocol itself

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod event;
pub mod group;
pub mod identity;
pub mod messaging;
pub mod pool;
pub mod store;
pub mod transport;

pub use config::MeshConfig;
pub use discovery::{AgentRecord, DirectoryPage, DirectoryQuery};
pub use error::MeshError;
pub use event::{Event, EventBuilder, Filter, UnsignedEvent};
pub use group::{ChannelMessage, ChannelMetadata, ChannelReceipt};
pub use identity::Identity;
pub use messaging::{DeliveryReceipt, MeshMessage, MessagePayload};
pub use pool::{PublishOutcome, RelayPool};
pub use store::{InboxMessage, InboxQuery, MeshStore, PeerRecord};
pub use transport::{RelayConnection, RelayConnector, Subscription, SubscriptionItem};
