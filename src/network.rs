//! The seam between the DHT engine and whatever carries its RPCs.
//!
//! [`DhtRpc`] is the DHT's view of the network: a single `call` primitive plus
//! typed helpers for every request kind. It is implemented by
//! [`crate::connection::ConnectionManager`] in production and by an in-memory
//! registry in tests. [`RpcHandler`] is the reverse direction: the network
//! hands inbound requests and connection events to the DHT through it.

use async_trait::async_trait;

use crate::descriptor::PeerDescriptor;
use crate::error::{DhtError, Result};
use crate::identifier::{Key, NodeId};
use crate::protocol::{DataEntry, RouteMessageWrapper, RpcRequest, RpcResponse};

fn unexpected(operation: &str, response: RpcResponse) -> DhtError {
    DhtError::Protocol(format!("unexpected response to {operation}: {response:?}"))
}

/// Outbound RPC surface used by the DHT layers.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Descriptor of the local node as advertised to peers.
    fn local_peer(&self) -> PeerDescriptor;

    /// Send one request and wait for its response.
    async fn call(&self, to: &PeerDescriptor, request: RpcRequest) -> Result<RpcResponse>;

    /// Keep the connection to `peer` open on behalf of `reason`.
    async fn lock_connection(&self, _peer: &PeerDescriptor, _reason: &str) {}

    async fn unlock_connection(&self, _peer: &PeerDescriptor, _reason: &str) {}

    /// A routed request asked us to dial `requester`. Returns whether a
    /// connection attempt was started.
    async fn accept_connection_request(&self, _requester: &PeerDescriptor) -> bool {
        false
    }

    /// Release every connection and lock. Later calls fail with `Stopped`.
    async fn stop(&self) {}

    /// Check if a contact is still responsive.
    async fn ping(&self, to: &PeerDescriptor) -> Result<()> {
        match self.call(to, RpcRequest::Ping).await? {
            RpcResponse::Pong => Ok(()),
            other => Err(unexpected("ping", other)),
        }
    }

    /// Ask a peer for the contacts it knows closest to `target`.
    async fn find_node(&self, to: &PeerDescriptor, target: NodeId) -> Result<Vec<PeerDescriptor>> {
        match self.call(to, RpcRequest::FindNode { target }).await? {
            RpcResponse::Nodes { nodes } => Ok(nodes),
            other => Err(unexpected("findNode", other)),
        }
    }

    /// Ask a peer for its entries under `key` and closer contacts.
    async fn find_data(
        &self,
        to: &PeerDescriptor,
        key: Key,
    ) -> Result<(Vec<DataEntry>, Vec<PeerDescriptor>)> {
        match self.call(to, RpcRequest::FindData { key }).await? {
            RpcResponse::Data { entries, closer } => Ok((entries, closer)),
            other => Err(unexpected("findData", other)),
        }
    }

    async fn store_data(
        &self,
        to: &PeerDescriptor,
        key: Key,
        data: Vec<u8>,
        ttl_ms: u64,
        storer_time: u64,
    ) -> Result<()> {
        let request = RpcRequest::StoreData {
            key,
            data,
            ttl_ms,
            storer_time,
        };
        match self.call(to, request).await? {
            RpcResponse::Stored => Ok(()),
            other => Err(unexpected("storeData", other)),
        }
    }

    /// Tombstone the entries we stored under `key` on a peer.
    async fn delete_data(&self, to: &PeerDescriptor, key: Key) -> Result<bool> {
        match self.call(to, RpcRequest::DeleteData { key }).await? {
            RpcResponse::Deleted { deleted } => Ok(deleted),
            other => Err(unexpected("deleteData", other)),
        }
    }

    async fn migrate_data(&self, to: &PeerDescriptor, entry: DataEntry) -> Result<()> {
        match self.call(to, RpcRequest::MigrateData { entry }).await? {
            RpcResponse::Migrated => Ok(()),
            other => Err(unexpected("migrateData", other)),
        }
    }

    /// Hand a routed message to the next hop. `Ok(Some(reason))` is a
    /// negative acknowledgement.
    async fn route_message(
        &self,
        to: &PeerDescriptor,
        message: RouteMessageWrapper,
    ) -> Result<Option<String>> {
        match self.call(to, RpcRequest::RouteMessage(message)).await? {
            RpcResponse::RouteAck { error } => Ok(error),
            other => Err(unexpected("routeMessage", other)),
        }
    }

    async fn forward_message(
        &self,
        to: &PeerDescriptor,
        message: RouteMessageWrapper,
    ) -> Result<Option<String>> {
        match self.call(to, RpcRequest::ForwardMessage(message)).await? {
            RpcResponse::RouteAck { error } => Ok(error),
            other => Err(unexpected("forwardMessage", other)),
        }
    }

    /// Have `to` run a data lookup on our behalf.
    async fn external_find_data(&self, to: &PeerDescriptor, key: Key) -> Result<Vec<DataEntry>> {
        match self.call(to, RpcRequest::ExternalFindData { key }).await? {
            RpcResponse::ExternalData { error: Some(error), .. } => Err(DhtError::Remote(error)),
            RpcResponse::ExternalData { entries, .. } => Ok(entries),
            other => Err(unexpected("externalFindData", other)),
        }
    }

    /// Have `to` store data into the DHT on our behalf.
    async fn external_store_data(
        &self,
        to: &PeerDescriptor,
        key: Key,
        data: Vec<u8>,
    ) -> Result<Vec<PeerDescriptor>> {
        match self.call(to, RpcRequest::ExternalStoreData { key, data }).await? {
            RpcResponse::ExternalStored { storers } => Ok(storers),
            other => Err(unexpected("externalStoreData", other)),
        }
    }
}

/// Inbound side: how the network delivers work to the DHT.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle_request(&self, from: &PeerDescriptor, request: RpcRequest) -> Result<RpcResponse>;

    async fn on_connected(&self, _peer: &PeerDescriptor) {}

    async fn on_disconnected(&self, _peer: &PeerDescriptor) {}

    /// Route a request asking `target` to dial `requester` back.
    async fn route_connection_request(
        &self,
        target: &PeerDescriptor,
        _requester: &PeerDescriptor,
    ) -> Result<()> {
        Err(DhtError::Unreachable(format!(
            "no route to {}",
            target.short_id()
        )))
    }
}
