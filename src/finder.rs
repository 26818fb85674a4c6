//! Iterative lookup for the nodes (or the data) closest to a target.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::contact::SortedContactList;
use crate::context::NodeContext;
use crate::descriptor::PeerDescriptor;
use crate::identifier::{closer_to, short_id, NodeId};
use crate::network::DhtRpc;
use crate::protocol::{DataEntry, FindMode};
use crate::store::now_millis;

/// Outcome of a recursive find.
#[derive(Clone, Debug, Default)]
pub struct FindResult {
    /// Nodes that answered, closest first. Always includes the local node.
    pub closest_nodes: Vec<PeerDescriptor>,
    /// Data mode only: entries found, one per storer, newest `storer_time` wins.
    pub data_entries: Vec<DataEntry>,
}

/// Collects entries by storer, keeping the newest version of each.
#[derive(Default)]
struct EntryAccumulator {
    by_storer: HashMap<NodeId, DataEntry>,
}

impl EntryAccumulator {
    fn merge(&mut self, entries: Vec<DataEntry>) {
        for entry in entries {
            let storer = entry.storer.node_id;
            match self.by_storer.get(&storer) {
                Some(existing) if existing.storer_time >= entry.storer_time => {}
                _ => {
                    self.by_storer.insert(storer, entry);
                }
            }
        }
    }

    fn into_sorted(self) -> Vec<DataEntry> {
        let mut entries: Vec<DataEntry> = self.by_storer.into_values().collect();
        entries.sort_by(|a, b| a.storer.node_id.cmp(&b.storer.node_id));
        entries
    }
}

pub struct RecursiveFinder<N: DhtRpc> {
    ctx: Arc<NodeContext<N>>,
}

impl<N: DhtRpc> RecursiveFinder<N> {
    pub(crate) fn new(ctx: Arc<NodeContext<N>>) -> Self {
        Self { ctx }
    }

    fn result_size(&self) -> usize {
        self.ctx.config.k.max(self.ctx.config.redundancy_factor)
    }

    /// Perform an iterative lookup for `target`.
    ///
    /// The lookup process:
    /// 1. Seed a candidate list from the routing table
    /// 2. Query up to `parallelism` uncontacted candidates concurrently
    /// 3. Merge the closer contacts each answer reports
    /// 4. Stop after `join_no_progress_limit` rounds that bring no contact
    ///    closer than the best seen so far, on `find_timeout`, on stop, or
    ///    once no candidates remain
    ///
    /// Failed peers are dropped for the rest of the search. `requestor` is
    /// never queried, which keeps relayed lookups from bouncing back.
    pub async fn find(
        &self,
        target: NodeId,
        mode: FindMode,
        requestor: Option<&PeerDescriptor>,
    ) -> FindResult {
        let ctx = &self.ctx;
        let limit = self.result_size();
        let parallelism = ctx.config.parallelism;
        let deadline = Instant::now() + ctx.config.find_timeout;

        let mut candidates = SortedContactList::new(target, limit).excluding(ctx.local.node_id);
        for peer in ctx.closest_contacts(&target, limit).await {
            candidates.add(peer);
        }
        if let Some(requestor) = requestor {
            candidates.remove(&requestor.node_id);
        }

        let mut entries = EntryAccumulator::default();
        let mut responders_with_data = 0usize;
        if mode == FindMode::Data {
            let local = {
                let mut store = ctx.store.lock().await;
                store.get_entries(&target, now_millis())
            };
            if !local.is_empty() {
                responders_with_data += 1;
                entries.merge(local);
            }
        }

        let mut best = candidates.first().map(|p| p.node_id);
        let mut no_progress = 0usize;
        loop {
            if ctx.is_stopped() {
                break;
            }
            if mode == FindMode::Data && responders_with_data >= ctx.config.redundancy_factor {
                trace!(key = %short_id(&target), "enough replicas found");
                break;
            }
            let batch = candidates.uncontacted(parallelism);
            if batch.is_empty() {
                break;
            }
            for peer in &batch {
                candidates.set_contacted(&peer.node_id);
            }

            let queries = batch.iter().map(|peer| self.query(peer, target, mode));
            let responses = tokio::select! {
                responses = join_all(queries) => responses,
                _ = sleep_until(deadline) => {
                    debug!(target = %short_id(&target), "recursive find timed out");
                    break;
                }
                _ = ctx.stopped() => break,
            };

            for (peer, response) in batch.into_iter().zip(responses) {
                match response {
                    Ok((found, closer)) => {
                        candidates.set_active(&peer.node_id);
                        if !found.is_empty() {
                            responders_with_data += 1;
                            entries.merge(found);
                        }
                        for contact in closer {
                            if requestor.map(|r| r.node_id) == Some(contact.node_id) {
                                continue;
                            }
                            candidates.add(contact);
                        }
                        ctx.observe_contact(peer).await;
                    }
                    Err(err) => {
                        trace!(peer = %peer.short_id(), error = %err, "dropping unreachable candidate");
                        candidates.remove(&peer.node_id);
                        if err.is_peer_failure() {
                            ctx.remove_contact(&peer.node_id).await;
                        }
                    }
                }
            }

            // dropping a failed candidate never counts as progress
            let closest_now = candidates.first().map(|p| p.node_id);
            let improved = match (closest_now, best) {
                (Some(now), Some(previous)) => closer_to(&target, &now, &previous) == Ordering::Less,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if improved {
                best = closest_now;
                no_progress = 0;
            } else {
                no_progress += 1;
                if no_progress >= ctx.config.join_no_progress_limit {
                    break;
                }
            }
        }

        let mut closest = SortedContactList::new(target, limit);
        closest.add(ctx.local.clone());
        for peer in candidates.active(limit) {
            closest.add(peer);
        }
        FindResult {
            closest_nodes: closest.all(),
            data_entries: entries.into_sorted(),
        }
    }

    async fn query(
        &self,
        peer: &PeerDescriptor,
        target: NodeId,
        mode: FindMode,
    ) -> crate::error::Result<(Vec<DataEntry>, Vec<PeerDescriptor>)> {
        match mode {
            FindMode::Node => {
                let nodes = self.ctx.rpc.find_node(peer, target).await?;
                Ok((Vec::new(), nodes))
            }
            FindMode::Data => self.ctx.rpc.find_data(peer, target).await,
        }
    }
}
