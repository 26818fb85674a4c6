//! Peer descriptors: how a node is identified and how it can be dialed.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::identifier::{short_id, NodeId};

/// Kind of process behind a descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    Native,
    NodeJs,
    Browser,
}

/// A reachable WebSocket endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityMethod {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ConnectivityMethod {
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Result of probing our own reachability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NatType {
    OpenInternet,
    Unknown,
}

/// What an entry point observed about us during a connectivity check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityResponse {
    pub open_internet: bool,
    pub host: String,
    pub nat_type: NatType,
    pub websocket: Option<ConnectivityMethod>,
}

impl ConnectivityResponse {
    /// Response used when no check could be performed.
    pub fn unknown() -> Self {
        Self {
            open_internet: false,
            host: "127.0.0.1".to_string(),
            nat_type: NatType::Unknown,
            websocket: None,
        }
    }
}

/// Identity and reachability of a peer.
///
/// Descriptors are plain values: copied freely, compared and hashed by
/// `node_id` only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub node_id: NodeId,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub websocket: Option<ConnectivityMethod>,
    /// JSON-serialised iroh `EndpointAddr` for the NAT-traversing transport.
    #[serde(default)]
    pub nat_addr: Option<String>,
    /// Index into the simulator's region latency matrix.
    #[serde(default)]
    pub region: Option<u32>,
}

impl PeerDescriptor {
    /// Descriptor carrying only an id, as used by simulated nodes.
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            node_type: NodeType::default(),
            websocket: None,
            nat_addr: None,
            region: None,
        }
    }

    pub fn with_websocket(mut self, websocket: ConnectivityMethod) -> Self {
        self.websocket = Some(websocket);
        self
    }

    pub fn with_region(mut self, region: u32) -> Self {
        self.region = Some(region);
        self
    }

    pub fn short_id(&self) -> String {
        short_id(&self.node_id)
    }
}

impl PartialEq for PeerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for PeerDescriptor {}

impl Hash for PeerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}
