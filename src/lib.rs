//! # mesh-dht
//!
//! A Kademlia distributed hash table meant to serve as the structural layer
//! of a peer-to-peer overlay. Nodes keep a routing table of known peers,
//! join the network through entry points, answer and issue recursive lookups
//! for peers and data, and replicate stored entries on the nodes closest to
//! each key.
//!
//! The crate is split into modules that can be used independently:
//!
//! - [`node`]: the [`DhtNode`] that composes everything below over an
//!   abstract [`DhtRpc`] transport.
//! - [`routing`] and [`contact`]: the bucketed routing table and the
//!   distance-sorted contact lists used by lookups.
//! - [`discovery`]: joining, rejoining after isolation and periodic recovery.
//! - [`finder`]: iterative lookups for nodes and for stored data.
//! - [`replication`] and [`store`]: the replicated store with stale tracking
//!   and migration towards closer nodes.
//! - [`router`]: multi-hop delivery of opaque messages.
//! - [`connection`]: one logical connection per peer over WebSocket, an iroh
//!   QUIC endpoint for NAT traversal, or the [`simulator`].
//! - [`protocol`] and [`framing`]: the JSON wire messages and the frame
//!   format used on byte streams.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mesh_dht::config::{ConnectionManagerConfig, DhtNodeConfig, PortRange};
//! use mesh_dht::connection::{ConnectionManager, DefaultConnectorFacade};
//! use mesh_dht::{random_node_id, DhtNode};
//!
//! # async fn launch() -> mesh_dht::Result<()> {
//! let config = ConnectionManagerConfig {
//!     websocket_port_range: Some(PortRange { min: 23000, max: 23010 }),
//!     ..ConnectionManagerConfig::default()
//! };
//! let facade = Arc::new(DefaultConnectorFacade::new(config.clone()));
//! let manager = ConnectionManager::start(config, random_node_id(), facade).await?;
//! let node = DhtNode::attach(manager, DhtNodeConfig::default())?;
//! node.join_dht(&[]).await;
//! let storers = node.store_data_to_dht(mesh_dht::hash_content(b"key"), b"value".to_vec()).await?;
//! # let _ = storers;
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` wires these pieces into a standalone node.

pub mod config;
pub mod connection;
pub mod contact;
mod context;
pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod events;
pub mod finder;
pub mod framing;
pub mod identifier;
pub mod network;
pub mod node;
pub mod protocol;
pub mod replication;
pub mod router;
pub mod routing;
pub mod simulator;
pub mod store;

pub use config::{ConnectionManagerConfig, DhtNodeConfig};
pub use connection::ConnectionManager;
pub use descriptor::{ConnectivityMethod, NatType, NodeType, PeerDescriptor};
pub use discovery::JoinState;
pub use error::{DhtError, HandshakeError, Result};
pub use events::DhtEvent;
pub use identifier::{derive_node_id, hash_content, random_node_id, Key, NodeId};
pub use network::{DhtRpc, RpcHandler};
pub use node::{DhtNode, TelemetrySnapshot};
pub use protocol::{DataEntry, FindMode};
pub use simulator::{LatencyType, Simulator};
