//! DHT wire message definitions.
//!
//! Every transport carries [`WireMessage`] values serialised as JSON. The first
//! exchange on a fresh connection is always a handshake; afterwards requests,
//! responses and notifications are multiplexed by `request_id`.

use serde::{Deserialize, Serialize};

use crate::descriptor::{ConnectivityMethod, PeerDescriptor};
use crate::error::{DhtError, HandshakeError};
use crate::identifier::{Key, NodeId};

/// What a recursive find is looking for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindMode {
    Node,
    Data,
}

/// A value stored under a key by one storer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataEntry {
    pub key: Key,
    /// Node that produced the entry.
    pub storer: PeerDescriptor,
    /// Opaque payload.
    pub data: Vec<u8>,
    pub ttl_ms: u64,
    /// Local reception time, milliseconds since the Unix epoch.
    pub stored_at: u64,
    /// Storer's clock when the entry was produced, milliseconds since the Unix epoch.
    pub storer_time: u64,
    /// The holder believes it is no longer among the closest nodes to `key`.
    pub stale: bool,
    /// Tombstone.
    pub deleted: bool,
}

impl DataEntry {
    pub fn expires_at(&self) -> u64 {
        self.stored_at.saturating_add(self.ttl_ms)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at() <= now_ms
    }
}

/// Envelope for multi-hop delivery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteMessageWrapper {
    pub destination: PeerDescriptor,
    pub source: PeerDescriptor,
    pub previous: Option<PeerDescriptor>,
    pub request_id: String,
    /// Nodes the message already traversed, used for loop detection.
    pub routing_path: Vec<PeerDescriptor>,
    #[serde(default)]
    pub reachable_through: Vec<PeerDescriptor>,
    /// Opaque body. For `ForwardMessage` this is a JSON-encoded inner wrapper.
    pub message: Vec<u8>,
}

impl RouteMessageWrapper {
    pub fn has_visited(&self, id: &NodeId) -> bool {
        self.routing_path.iter().any(|p| &p.node_id == id)
    }
}

/// Requests understood by a DHT node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Ping,
    FindNode {
        target: NodeId,
    },
    FindData {
        key: Key,
    },
    StoreData {
        key: Key,
        data: Vec<u8>,
        ttl_ms: u64,
        storer_time: u64,
    },
    DeleteData {
        key: Key,
    },
    MigrateData {
        entry: DataEntry,
    },
    RouteMessage(RouteMessageWrapper),
    ForwardMessage(RouteMessageWrapper),
    ExternalFindData {
        key: Key,
    },
    ExternalStoreData {
        key: Key,
        data: Vec<u8>,
    },
    /// Ask the receiver to dial the requester's WebSocket server.
    WebSocketConnectionRequest {
        requester: PeerDescriptor,
    },
    /// Sent as a notification when a peer shuts down gracefully.
    Leave,
}

impl RpcRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::FindNode { .. } => "findNode",
            Self::FindData { .. } => "findData",
            Self::StoreData { .. } => "storeData",
            Self::DeleteData { .. } => "deleteData",
            Self::MigrateData { .. } => "migrateData",
            Self::RouteMessage(_) => "routeMessage",
            Self::ForwardMessage(_) => "forwardMessage",
            Self::ExternalFindData { .. } => "externalFindData",
            Self::ExternalStoreData { .. } => "externalStoreData",
            Self::WebSocketConnectionRequest { .. } => "requestConnection",
            Self::Leave => "leaveNotice",
        }
    }
}

/// Responses, one shape per request kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Pong,
    Nodes {
        nodes: Vec<PeerDescriptor>,
    },
    Data {
        entries: Vec<DataEntry>,
        closer: Vec<PeerDescriptor>,
    },
    Stored,
    Deleted {
        deleted: bool,
    },
    Migrated,
    RouteAck {
        error: Option<String>,
    },
    ExternalData {
        entries: Vec<DataEntry>,
        error: Option<String>,
    },
    ExternalStored {
        storers: Vec<PeerDescriptor>,
    },
    ConnectionRequestAck {
        accepted: bool,
    },
}

/// Everything that travels over a connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireMessage {
    HandshakeRequest {
        source: PeerDescriptor,
        /// Who the dialer believes it reached.
        target: Option<PeerDescriptor>,
        protocol_version: String,
    },
    HandshakeResponse {
        source: PeerDescriptor,
        error: Option<HandshakeError>,
    },
    Request {
        request_id: u64,
        body: RpcRequest,
    },
    Response {
        request_id: u64,
        body: Result<RpcResponse, String>,
    },
    Notification {
        body: RpcRequest,
    },
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, DhtError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DhtError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Request sent over a `connectivityRequest` WebSocket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectivityRequest {
    pub port: u16,
    pub tls: bool,
    pub host: Option<String>,
}

/// Helper for building a WebSocket [`ConnectivityMethod`] from a probe result.
pub fn probed_websocket(host: &str, request: &ConnectivityRequest) -> ConnectivityMethod {
    ConnectivityMethod {
        host: request.host.clone().unwrap_or_else(|| host.to_string()),
        port: request.port,
        tls: request.tls,
    }
}
