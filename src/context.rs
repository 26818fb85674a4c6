//! State shared by the components of one DHT node.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::config::DhtNodeConfig;
use crate::contact::SortedContactList;
use crate::descriptor::PeerDescriptor;
use crate::events::{DhtEvent, EventBus};
use crate::identifier::{Key, NodeId};
use crate::network::DhtRpc;
use crate::routing::{BucketTouchOutcome, PendingBucketUpdate, RoutingTable};
use crate::store::LocalDataStore;

/// Everything the finder, discovery, store engine and router operate on.
///
/// The routing table and the data store are only mutated through methods of
/// the owning node's components; other code reads them through snapshots.
pub(crate) struct NodeContext<N: DhtRpc> {
    pub local: PeerDescriptor,
    pub config: DhtNodeConfig,
    pub rpc: Arc<N>,
    pub routing: Mutex<RoutingTable>,
    pub store: Mutex<LocalDataStore>,
    pub events: EventBus,
    stop_tx: watch::Sender<bool>,
}

impl<N: DhtRpc> NodeContext<N> {
    pub fn new(rpc: Arc<N>, config: DhtNodeConfig) -> Self {
        let local = rpc.local_peer();
        let (stop_tx, _) = watch::channel(false);
        Self {
            routing: Mutex::new(RoutingTable::new(local.node_id, config.k)),
            store: Mutex::new(LocalDataStore::new(config.max_stored_keys)),
            events: EventBus::new(),
            local,
            config,
            rpc,
            stop_tx,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local.node_id
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Resolves once the node has been stopped.
    pub async fn stopped(&self) {
        let mut rx = self.stop_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Observe a contact and update the routing table.
    ///
    /// If the bucket for this contact is full, spawns a background task to
    /// ping the oldest contact and decide whether to evict it.
    pub async fn observe_contact(self: &Arc<Self>, contact: PeerDescriptor) {
        if contact.node_id == self.local.node_id || self.is_stopped() {
            return;
        }
        let outcome = {
            let mut rt = self.routing.lock().await;
            rt.update(contact.clone())
        };
        match outcome {
            BucketTouchOutcome::Inserted => {
                debug!(peer = %contact.short_id(), "new contact");
                self.events.publish(DhtEvent::NewContact(contact));
            }
            BucketTouchOutcome::Full(pending) => self.spawn_bucket_refresh(pending),
            BucketTouchOutcome::Refreshed | BucketTouchOutcome::Ignored => {}
        }
    }

    /// Ping-before-evict for a full bucket.
    fn spawn_bucket_refresh(self: &Arc<Self>, pending: PendingBucketUpdate) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let alive = match ctx.rpc.ping(&pending.oldest).await {
                Ok(()) => true,
                Err(err) => {
                    debug!(peer = %pending.oldest.short_id(), error = %err, "ping failed");
                    false
                }
            };
            if ctx.is_stopped() {
                return;
            }
            let result = {
                let mut rt = ctx.routing.lock().await;
                rt.apply_ping_result(pending, alive)
            };
            if let Some(removed) = result.removed {
                ctx.events.publish(DhtEvent::ContactRemoved(removed));
            }
            if let Some(inserted) = result.inserted {
                ctx.events.publish(DhtEvent::NewContact(inserted));
            }
        });
    }

    /// Drop a contact that failed or left.
    pub async fn remove_contact(&self, id: &NodeId) {
        let removed = {
            let mut rt = self.routing.lock().await;
            rt.remove(id)
        };
        if let Some(peer) = removed {
            debug!(peer = %peer.short_id(), "contact removed");
            self.events.publish(DhtEvent::ContactRemoved(peer));
        }
    }

    pub async fn closest_contacts(&self, target: &NodeId, n: usize) -> Vec<PeerDescriptor> {
        let rt = self.routing.lock().await;
        rt.closest(target, n)
    }

    pub async fn routing_table_is_empty(&self) -> bool {
        self.routing.lock().await.is_empty()
    }

    /// The `redundancy_factor` closest nodes to `key` among the local node,
    /// the routing table and `extra`.
    pub async fn replica_set(&self, key: &Key, extra: &[PeerDescriptor]) -> SortedContactList {
        let rf = self.config.redundancy_factor;
        let mut list = SortedContactList::new(*key, rf);
        list.add(self.local.clone());
        for peer in self.closest_contacts(key, rf).await {
            list.add(peer);
        }
        for peer in extra {
            list.add(peer.clone());
        }
        list
    }
}
