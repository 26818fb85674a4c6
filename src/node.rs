//! The DHT node: composes discovery, lookups, storage and routing.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, trace};

use crate::config::DhtNodeConfig;
use crate::connection::ConnectionManager;
use crate::context::NodeContext;
use crate::descriptor::PeerDescriptor;
use crate::discovery::{JoinState, PeerDiscovery};
use crate::error::{DhtError, Result};
use crate::events::DhtEvent;
use crate::finder::{FindResult, RecursiveFinder};
use crate::identifier::{short_id, Key, NodeId};
use crate::network::{DhtRpc, RpcHandler};
use crate::protocol::{DataEntry, FindMode, RpcRequest, RpcResponse};
use crate::replication::StoreEngine;
use crate::router::Router;
use crate::store::now_millis;

const NOT_FOUND: &str = "Could not find data with the given key";

/// Snapshot of node state for logging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub routing_table_size: usize,
    pub stored_keys: usize,
    pub join_state: JoinState,
}

/// A Kademlia DHT node.
///
/// A `DhtNode` owns a routing table and a local data store and drives the
/// join, lookup, replication and routing protocols over an abstract
/// [`DhtRpc`] transport. The type is generic over that transport so tests can
/// use an in-memory registry while production uses a [`ConnectionManager`].
///
/// Inbound requests arrive through the [`RpcHandler`] implementation.
pub struct DhtNode<N: DhtRpc> {
    ctx: Arc<NodeContext<N>>,
    finder: Arc<RecursiveFinder<N>>,
    discovery: Arc<PeerDiscovery<N>>,
    storage: Arc<StoreEngine<N>>,
    router: Router<N>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl<N: DhtRpc> DhtNode<N> {
    /// Build a node on top of `rpc` and start its background tasks.
    pub fn new(rpc: Arc<N>, config: DhtNodeConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let ctx = Arc::new(NodeContext::new(rpc, config));
        let finder = Arc::new(RecursiveFinder::new(ctx.clone()));
        let node = Arc::new(Self {
            discovery: Arc::new(PeerDiscovery::new(ctx.clone())),
            storage: Arc::new(StoreEngine::new(ctx.clone(), finder.clone())),
            router: Router::new(ctx.clone()),
            finder,
            ctx,
            tasks: StdMutex::new(Vec::new()),
        });
        let contacts = node.spawn_contact_listener();
        let sweep = node.spawn_ttl_sweep();
        node.tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend([contacts, sweep]);
        info!(node = %node.ctx.local.short_id(), "DHT node started");
        Ok(node)
    }

    /// Run the migration check for every contact that enters the routing table.
    fn spawn_contact_listener(&self) -> JoinHandle<()> {
        let mut events = self.ctx.events.subscribe();
        let ctx = self.ctx.clone();
        let storage = self.storage.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = ctx.stopped() => break,
                };
                match event {
                    Some(DhtEvent::NewContact(peer)) => storage.on_new_contact(&peer).await,
                    Some(_) => {}
                    None => break,
                }
            }
        })
    }

    fn spawn_ttl_sweep(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let mut ticker = interval(ctx.config.ttl_sweep_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = ctx.stopped() => break,
                }
                let purged = ctx.store.lock().await.purge_expired(now_millis());
                if purged > 0 {
                    debug!(purged, "expired entries purged");
                }
            }
        })
    }

    pub fn local_peer(&self) -> &PeerDescriptor {
        &self.ctx.local
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.local.node_id
    }

    pub fn config(&self) -> &DhtNodeConfig {
        &self.ctx.config
    }

    pub fn rpc(&self) -> &Arc<N> {
        &self.ctx.rpc
    }

    pub fn is_stopped(&self) -> bool {
        self.ctx.is_stopped()
    }

    pub fn join_state(&self) -> JoinState {
        self.discovery.state()
    }

    pub fn is_rejoining(&self) -> bool {
        self.discovery.is_rejoining()
    }

    /// Receive `NewContact`, `ContactRemoved` and routed `Message` events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DhtEvent> {
        self.ctx.events.subscribe()
    }

    /// Join the DHT through the given entry points.
    pub async fn join_dht(&self, entry_points: &[PeerDescriptor]) {
        self.discovery.join_dht(entry_points).await;
    }

    /// Run one recovery scan right away instead of waiting for the interval.
    pub async fn run_recovery(&self) {
        self.discovery.recover().await;
    }

    /// Add a contact to the routing table (ping-before-evict applies).
    pub async fn observe_contact(&self, contact: PeerDescriptor) {
        self.ctx.observe_contact(contact).await;
    }

    pub async fn start_recursive_find(
        &self,
        target: NodeId,
        mode: FindMode,
        requestor: Option<&PeerDescriptor>,
    ) -> FindResult {
        self.finder.find(target, mode, requestor).await
    }

    /// Nodes closest to `target` found by a recursive lookup.
    pub async fn find_closest_nodes(&self, target: NodeId) -> Vec<PeerDescriptor> {
        self.finder
            .find(target, FindMode::Node, None)
            .await
            .closest_nodes
    }

    /// Entries stored under `key` anywhere in the DHT, tombstones included.
    pub async fn find_data(&self, key: Key) -> Vec<DataEntry> {
        self.finder
            .find(key, FindMode::Data, None)
            .await
            .data_entries
    }

    pub async fn store_data_to_dht(&self, key: Key, data: Vec<u8>) -> Result<Vec<PeerDescriptor>> {
        self.storage.store_data_to_dht(key, data).await
    }

    pub async fn delete_data_from_dht(&self, key: Key) -> Result<()> {
        self.storage.delete_data_from_dht(key).await
    }

    /// Look data up through a peer, without being part of the DHT.
    pub async fn find_data_via_peer(&self, peer: &PeerDescriptor, key: Key) -> Result<Vec<DataEntry>> {
        self.ctx.rpc.external_find_data(peer, key).await
    }

    /// Store data through a peer, without being part of the DHT.
    pub async fn store_data_via_peer(
        &self,
        peer: &PeerDescriptor,
        key: Key,
        data: Vec<u8>,
    ) -> Result<Vec<PeerDescriptor>> {
        self.ctx.rpc.external_store_data(peer, key, data).await
    }

    /// Up to `n` routing-table contacts closest to the local node.
    ///
    /// Defaults to `get_closest_contacts_limit`.
    pub async fn get_closest_contacts(&self, n: Option<usize>) -> Vec<PeerDescriptor> {
        let n = n.unwrap_or(self.ctx.config.get_closest_contacts_limit);
        self.ctx.closest_contacts(&self.ctx.local.node_id, n).await
    }

    pub async fn routing_table_size(&self) -> usize {
        self.ctx.routing.lock().await.len()
    }

    /// Entries held locally under `key`, expired ones excluded.
    pub async fn local_entries(&self, key: &Key) -> Vec<DataEntry> {
        self.ctx.store.lock().await.get_entries(key, now_millis())
    }

    pub async fn lock_connection(&self, peer: &PeerDescriptor, reason: &str) {
        self.ctx.rpc.lock_connection(peer, reason).await;
    }

    pub async fn unlock_connection(&self, peer: &PeerDescriptor, reason: &str) {
        self.ctx.rpc.unlock_connection(peer, reason).await;
    }

    /// Deliver `payload` to `destination` over multiple hops.
    pub async fn route_message(&self, destination: &PeerDescriptor, payload: Vec<u8>) -> Result<()> {
        self.router.send(destination, payload).await
    }

    /// Deliver `payload` to `destination`, entering the overlay through `via`.
    pub async fn forward_message(
        &self,
        via: &PeerDescriptor,
        destination: &PeerDescriptor,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.router.forward_through(via, destination, payload).await
    }

    pub async fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let routing_table_size = self.routing_table_size().await;
        let stored_keys = self.ctx.store.lock().await.len();
        TelemetrySnapshot {
            routing_table_size,
            stored_keys,
            join_state: self.join_state(),
        }
    }

    /// Stop every background task, abort in-flight sessions and release
    /// connections. Further requests fail with [`DhtError::Stopped`].
    pub async fn stop(&self) {
        if self.ctx.is_stopped() {
            return;
        }
        info!(node = %self.ctx.local.short_id(), "stopping DHT node");
        self.ctx.signal_stop();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.ctx.rpc.stop().await;
    }

    async fn handle_external_find(&self, from: &PeerDescriptor, key: Key) -> RpcResponse {
        let result = self.finder.find(key, FindMode::Data, Some(from)).await;
        let entries: Vec<DataEntry> = result
            .data_entries
            .into_iter()
            .filter(|e| !e.deleted)
            .collect();
        if entries.is_empty() {
            RpcResponse::ExternalData {
                entries,
                error: Some(NOT_FOUND.to_string()),
            }
        } else {
            RpcResponse::ExternalData {
                entries,
                error: None,
            }
        }
    }
}

impl DhtNode<ConnectionManager> {
    /// Build a node on a started connection manager and register it as the
    /// manager's request handler.
    pub fn attach(manager: Arc<ConnectionManager>, config: DhtNodeConfig) -> Result<Arc<Self>> {
        let node = Self::new(manager.clone(), config)?;
        let handler: Arc<dyn RpcHandler> = node.clone();
        manager.set_handler(Arc::downgrade(&handler));
        Ok(node)
    }
}

#[async_trait]
impl<N: DhtRpc> RpcHandler for DhtNode<N> {
    async fn handle_request(&self, from: &PeerDescriptor, request: RpcRequest) -> Result<RpcResponse> {
        let ctx = &self.ctx;
        if ctx.is_stopped() {
            return Err(DhtError::Stopped);
        }
        trace!(peer = %from.short_id(), rpc = request.name(), "handling request");
        if !matches!(request, RpcRequest::Leave) {
            ctx.observe_contact(from.clone()).await;
        }

        let response = match request {
            RpcRequest::Ping => RpcResponse::Pong,
            RpcRequest::FindNode { target } => {
                let nodes = ctx
                    .closest_contacts(&target, ctx.config.k + 1)
                    .await
                    .into_iter()
                    .filter(|p| p.node_id != from.node_id)
                    .take(ctx.config.k)
                    .collect();
                RpcResponse::Nodes { nodes }
            }
            RpcRequest::FindData { key } => {
                let entries = ctx.store.lock().await.get_entries(&key, now_millis());
                let closer = ctx
                    .closest_contacts(&key, ctx.config.k + 1)
                    .await
                    .into_iter()
                    .filter(|p| p.node_id != from.node_id)
                    .take(ctx.config.k)
                    .collect();
                RpcResponse::Data { entries, closer }
            }
            RpcRequest::StoreData {
                key,
                data,
                ttl_ms,
                storer_time,
            } => {
                self.storage
                    .handle_store_data(from, key, data, ttl_ms, storer_time)
                    .await;
                RpcResponse::Stored
            }
            RpcRequest::DeleteData { key } => RpcResponse::Deleted {
                deleted: self.storage.handle_delete_data(from, key).await,
            },
            RpcRequest::MigrateData { entry } => {
                self.storage.handle_migrate_data(from, entry).await;
                RpcResponse::Migrated
            }
            RpcRequest::RouteMessage(message) => RpcResponse::RouteAck {
                error: self.router.handle(message, false).await,
            },
            RpcRequest::ForwardMessage(message) => RpcResponse::RouteAck {
                error: self.router.handle(message, true).await,
            },
            RpcRequest::ExternalFindData { key } => self.handle_external_find(from, key).await,
            RpcRequest::ExternalStoreData { key, data } => {
                let storers = self.storage.store_data_to_dht(key, data).await?;
                RpcResponse::ExternalStored { storers }
            }
            RpcRequest::WebSocketConnectionRequest { requester } => RpcResponse::ConnectionRequestAck {
                accepted: ctx.rpc.accept_connection_request(&requester).await,
            },
            RpcRequest::Leave => {
                debug!(peer = %from.short_id(), "peer left");
                ctx.remove_contact(&from.node_id).await;
                RpcResponse::Pong
            }
        };
        Ok(response)
    }

    async fn on_connected(&self, peer: &PeerDescriptor) {
        trace!(peer = %peer.short_id(), "transport connected");
    }

    async fn on_disconnected(&self, peer: &PeerDescriptor) {
        trace!(peer = %peer.short_id(), "transport disconnected");
    }

    async fn route_connection_request(
        &self,
        target: &PeerDescriptor,
        requester: &PeerDescriptor,
    ) -> Result<()> {
        let payload = serde_json::to_vec(&RpcRequest::WebSocketConnectionRequest {
            requester: requester.clone(),
        })?;
        trace!(target = %short_id(&target.node_id), "routing connection request");
        self.router.send_indirect(target, payload).await
    }
}
