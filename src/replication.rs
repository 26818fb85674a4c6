//! Replicated storage on top of the local data store.
//!
//! Entries live on the `redundancy_factor` nodes closest to their key. Each
//! holder keeps a derived `stale` flag telling whether it still belongs to
//! that set, and pushes copies towards closer nodes as they appear.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::contact::SortedContactList;
use crate::context::NodeContext;
use crate::descriptor::PeerDescriptor;
use crate::error::{DhtError, Result};
use crate::finder::RecursiveFinder;
use crate::identifier::{short_id, Key};
use crate::network::DhtRpc;
use crate::protocol::{DataEntry, FindMode};
use crate::store::now_millis;

pub struct StoreEngine<N: DhtRpc> {
    ctx: Arc<NodeContext<N>>,
    finder: Arc<RecursiveFinder<N>>,
}

impl<N: DhtRpc> StoreEngine<N> {
    pub(crate) fn new(ctx: Arc<NodeContext<N>>, finder: Arc<RecursiveFinder<N>>) -> Self {
        Self { ctx, finder }
    }

    /// Store `data` on the nodes closest to `key`.
    ///
    /// Stops once `redundancy_factor` nodes acknowledged. Storing on the local
    /// node counts as an acknowledgement. Returns the nodes that stored it.
    pub async fn store_data_to_dht(&self, key: Key, data: Vec<u8>) -> Result<Vec<PeerDescriptor>> {
        let ctx = &self.ctx;
        if ctx.is_stopped() {
            return Err(DhtError::Stopped);
        }
        let result = self.finder.find(key, FindMode::Data, None).await;
        let ttl_ms = ctx.config.highest_ttl.as_millis() as u64;
        let storer_time = now_millis();

        let mut storers = Vec::new();
        for node in result.closest_nodes {
            if storers.len() >= ctx.config.redundancy_factor {
                break;
            }
            if node.node_id == ctx.local.node_id {
                self.handle_store_data(&ctx.local, key, data.clone(), ttl_ms, storer_time)
                    .await;
                storers.push(node);
                continue;
            }
            match ctx
                .rpc
                .store_data(&node, key, data.clone(), ttl_ms, storer_time)
                .await
            {
                Ok(()) => storers.push(node),
                Err(err) => {
                    debug!(peer = %node.short_id(), key = %short_id(&key), error = %err, "storeData failed");
                }
            }
        }
        debug!(key = %short_id(&key), storers = storers.len(), "stored data to DHT");
        Ok(storers)
    }

    /// Tombstone our entries under `key` on the nodes closest to it.
    ///
    /// Individual failures are tolerated.
    pub async fn delete_data_from_dht(&self, key: Key) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.is_stopped() {
            return Err(DhtError::Stopped);
        }
        let result = self.finder.find(key, FindMode::Data, None).await;
        for node in result
            .closest_nodes
            .into_iter()
            .take(ctx.config.redundancy_factor)
        {
            if node.node_id == ctx.local.node_id {
                let mut store = ctx.store.lock().await;
                store.mark_as_deleted(&key, &ctx.local.node_id);
                continue;
            }
            if let Err(err) = ctx.rpc.delete_data(&node, key).await {
                debug!(peer = %node.short_id(), key = %short_id(&key), error = %err, "deleteData failed");
            }
        }
        Ok(())
    }

    /// Server side of `storeData`.
    ///
    /// The TTL is clamped to `max_ttl`. Every entry under `key` is marked
    /// stale unless the local node is among the closest to it, judged from
    /// the routing table plus the requester.
    pub async fn handle_store_data(
        &self,
        from: &PeerDescriptor,
        key: Key,
        data: Vec<u8>,
        ttl_ms: u64,
        storer_time: u64,
    ) {
        let entry = DataEntry {
            key,
            storer: from.clone(),
            data,
            ttl_ms: ttl_ms.min(self.ctx.config.max_ttl.as_millis() as u64),
            stored_at: now_millis(),
            storer_time,
            stale: false,
            deleted: false,
        };
        self.store_and_classify(entry, from).await;
    }

    /// Insert and recompute the key's stale flags under one store lock.
    async fn store_and_classify(&self, entry: DataEntry, requester: &PeerDescriptor) -> bool {
        let ctx = &self.ctx;
        let key = entry.key;
        let replicas = ctx.replica_set(&key, std::slice::from_ref(requester)).await;
        let among_closest = replicas.contains(&ctx.local.node_id);
        let mut store = ctx.store.lock().await;
        let stored = store.store_entry(entry);
        store.set_all_stale(&key, !among_closest);
        trace!(key = %short_id(&key), stored, among_closest, "entry stored");
        stored
    }

    /// Server side of `deleteData`: tombstone what `from` stored under `key`.
    pub async fn handle_delete_data(&self, from: &PeerDescriptor, key: Key) -> bool {
        let mut store = self.ctx.store.lock().await;
        store.mark_as_deleted(&key, &from.node_id)
    }

    /// Server side of `migrateData`.
    ///
    /// The entry keeps the timestamps it had on the previous holder. A newly
    /// accepted entry is pushed on in the background, judged from the
    /// `redundancy_factor` closest nodes including the local one: when another
    /// node heads that list only it receives the entry, otherwise the rest of
    /// the list does. The sender and the local node are never targets.
    pub async fn handle_migrate_data(&self, from: &PeerDescriptor, mut entry: DataEntry) {
        let ctx = &self.ctx;
        entry.stale = false;
        if !self.store_and_classify(entry.clone(), from).await {
            return;
        }

        let replicas = ctx.replica_set(&entry.key, &[]).await.all();
        let is_target = |p: &&PeerDescriptor| p.node_id != from.node_id && p.node_id != ctx.local.node_id;
        let targets: Vec<PeerDescriptor> = match replicas.first() {
            Some(closest) if closest.node_id == ctx.local.node_id => {
                replicas.iter().filter(is_target).cloned().collect()
            }
            Some(closest) => std::iter::once(closest).filter(is_target).cloned().collect(),
            None => Vec::new(),
        };
        self.spawn_migrations(entry, targets);
    }

    /// React to a contact entering the routing table.
    ///
    /// Recomputes `stale` for every held key and, when the local node was the
    /// closest to a key before `contact` arrived and `contact` now belongs to
    /// the replica set, migrates that key's entries to it.
    pub async fn on_new_contact(&self, contact: &PeerDescriptor) {
        let ctx = &self.ctx;
        if ctx.is_stopped() {
            return;
        }
        let keys = {
            let store = ctx.store.lock().await;
            store.keys()
        };
        for key in keys {
            let replicas = ctx.replica_set(&key, std::slice::from_ref(contact)).await;
            let among_closest = replicas.contains(&ctx.local.node_id);
            let contact_in_set = replicas.contains(&contact.node_id);

            let was_closest = {
                let mut before = SortedContactList::new(key, 1);
                before.add(ctx.local.clone());
                for peer in ctx.closest_contacts(&key, 2).await {
                    if peer.node_id != contact.node_id {
                        before.add(peer);
                    }
                }
                before.first().map(|p| p.node_id) == Some(ctx.local.node_id)
            };

            let to_migrate = {
                let mut store = ctx.store.lock().await;
                store.set_all_stale(&key, !among_closest);
                if was_closest && contact_in_set {
                    store.get_entries(&key, now_millis())
                } else {
                    Vec::new()
                }
            };
            for entry in to_migrate {
                self.spawn_migrations(entry, vec![contact.clone()]);
            }
        }
    }

    /// Fire-and-forget `migrateData` sends; failures are only logged.
    fn spawn_migrations(&self, entry: DataEntry, targets: Vec<PeerDescriptor>) {
        if targets.is_empty() {
            return;
        }
        let rpc = self.ctx.rpc.clone();
        tokio::spawn(async move {
            for target in targets {
                trace!(peer = %target.short_id(), key = %short_id(&entry.key), "migrating entry");
                if let Err(err) = rpc.migrate_data(&target, entry.clone()).await {
                    debug!(peer = %target.short_id(), key = %short_id(&entry.key), error = %err, "migrateData failed");
                }
            }
        });
    }
}
