//! Joining the network and keeping the routing table populated.
//!
//! A join runs [`DiscoverySession`]s that repeatedly ask the closest known
//! peers for contacts near a target and feed every answer into the routing
//! table. If the table is still empty afterwards the node keeps retrying in
//! the background; otherwise a periodic recovery scan is started once.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::join_all;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::context::NodeContext;
use crate::descriptor::PeerDescriptor;
use crate::error::{DhtError, Result};
use crate::identifier::{closer_to, random_node_id, short_id, xor_distance, NodeId};
use crate::network::DhtRpc;

const JOIN_LOCK_REASON: &str = "joinDht";

/// Where a node stands in the join protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinState {
    NotJoined,
    Joining,
    Joined,
}

/// One bounded walk towards a target id.
pub struct DiscoverySession<N: DhtRpc> {
    ctx: Arc<NodeContext<N>>,
    target: NodeId,
    contacted: HashSet<NodeId>,
    no_progress_count: usize,
}

impl<N: DhtRpc> DiscoverySession<N> {
    pub(crate) fn new(ctx: Arc<NodeContext<N>>, target: NodeId) -> Self {
        Self {
            ctx,
            target,
            contacted: HashSet::new(),
            no_progress_count: 0,
        }
    }

    async fn closest_distance(&self) -> Option<[u8; 32]> {
        self.ctx
            .closest_contacts(&self.target, 1)
            .await
            .first()
            .map(|p| xor_distance(&p.node_id, &self.target))
    }

    /// Run until `join_no_progress_limit` rounds pass without a closer
    /// contact or no uncontacted candidates remain.
    pub async fn run(mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        let parallelism = ctx.config.parallelism;
        loop {
            if ctx.is_stopped() {
                return Err(DhtError::Stopped);
            }
            let candidates: Vec<PeerDescriptor> = ctx
                .closest_contacts(&self.target, ctx.config.k)
                .await
                .into_iter()
                .filter(|p| !self.contacted.contains(&p.node_id))
                .take(parallelism)
                .collect();
            if candidates.is_empty() {
                return Ok(());
            }
            for peer in &candidates {
                self.contacted.insert(peer.node_id);
            }

            let before = self.closest_distance().await;
            let target = self.target;
            let responses = join_all(
                candidates
                    .iter()
                    .map(|peer| ctx.rpc.find_node(peer, target)),
            )
            .await;

            for (peer, response) in candidates.into_iter().zip(responses) {
                match response {
                    Ok(contacts) => {
                        trace!(peer = %peer.short_id(), found = contacts.len(), "discovery response");
                        ctx.observe_contact(peer).await;
                        for contact in contacts {
                            ctx.observe_contact(contact).await;
                        }
                    }
                    Err(err) => {
                        debug!(peer = %peer.short_id(), error = %err, "discovery request failed");
                        ctx.remove_contact(&peer.node_id).await;
                    }
                }
            }

            let after = self.closest_distance().await;
            let improved = match (before, after) {
                (None, Some(_)) => true,
                (Some(b), Some(a)) => a < b,
                _ => false,
            };
            if improved {
                self.no_progress_count = 0;
            } else {
                self.no_progress_count += 1;
                if self.no_progress_count >= ctx.config.join_no_progress_limit {
                    return Ok(());
                }
            }
        }
    }
}

/// The join protocol plus rejoin and recovery bookkeeping.
pub struct PeerDiscovery<N: DhtRpc> {
    ctx: Arc<NodeContext<N>>,
    state: StdMutex<JoinState>,
    entry_points: StdMutex<Vec<PeerDescriptor>>,
    rejoin_ongoing: AtomicBool,
    recovery_started: AtomicBool,
}

impl<N: DhtRpc> PeerDiscovery<N> {
    pub(crate) fn new(ctx: Arc<NodeContext<N>>) -> Self {
        Self {
            ctx,
            state: StdMutex::new(JoinState::NotJoined),
            entry_points: StdMutex::new(Vec::new()),
            rejoin_ongoing: AtomicBool::new(false),
            recovery_started: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> JoinState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: JoinState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn is_rejoining(&self) -> bool {
        self.rejoin_ongoing.load(Ordering::SeqCst)
    }

    /// Join through every entry point concurrently.
    pub async fn join_dht(self: &Arc<Self>, entry_points: &[PeerDescriptor]) {
        {
            let mut known = self.entry_points.lock().unwrap_or_else(|p| p.into_inner());
            for entry in entry_points {
                if !known.contains(entry) {
                    known.push(entry.clone());
                }
            }
        }
        join_all(
            entry_points
                .iter()
                .map(|entry| self.join_through(entry, self.ctx.config.random_join, true)),
        )
        .await;
    }

    /// Join through one entry point.
    ///
    /// A no-op when the entry point is the local node. Session timeouts are
    /// logged and swallowed; only stop aborts the join.
    pub async fn join_through(self: &Arc<Self>, entry: &PeerDescriptor, random_join: bool, retry: bool) {
        let ctx = &self.ctx;
        if ctx.is_stopped() || entry.node_id == ctx.local.node_id {
            return;
        }
        info!(entry = %entry.short_id(), "joining DHT");
        if self.state() == JoinState::NotJoined {
            self.set_state(JoinState::Joining);
        }
        ctx.rpc.lock_connection(entry, JOIN_LOCK_REASON).await;
        ctx.observe_contact(entry.clone()).await;

        let own = DiscoverySession::new(ctx.clone(), ctx.local.node_id).run();
        let random_target = random_node_id();
        let sessions = async {
            if random_join {
                let random = DiscoverySession::new(ctx.clone(), random_target).run();
                let (a, b) = futures::join!(own, random);
                a.and(b)
            } else {
                own.await
            }
        };
        tokio::select! {
            outcome = timeout(ctx.config.join_timeout, sessions) => match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "discovery session aborted"),
                Err(_) => debug!(entry = %entry.short_id(), "join timed out"),
            },
            _ = ctx.stopped() => {}
        }
        ctx.rpc.unlock_connection(entry, JOIN_LOCK_REASON).await;

        if ctx.is_stopped() {
            return;
        }
        if ctx.routing_table_is_empty().await {
            if retry {
                warn!(entry = %entry.short_id(), "join left the routing table empty, scheduling rejoin");
                self.spawn_rejoin(entry.clone());
            }
        } else {
            self.set_state(JoinState::Joined);
            self.ensure_recovery();
        }
    }

    /// Retry joining through `entry` every `rejoin_delay` until the routing
    /// table is non-empty or the node stops. Suppressed while one is running.
    pub fn spawn_rejoin(self: &Arc<Self>, entry: PeerDescriptor) {
        if self.ctx.is_stopped() || self.rejoin_ongoing.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(this.ctx.config.rejoin_delay) => {}
                    _ = this.ctx.stopped() => break,
                }
                debug!(entry = %entry.short_id(), "rejoining DHT");
                this.join_through(&entry, false, false).await;
                if this.ctx.is_stopped() || !this.ctx.routing_table_is_empty().await {
                    break;
                }
            }
            this.rejoin_ongoing.store(false, Ordering::SeqCst);
        });
    }

    /// Start the periodic recovery scan, once per node lifetime.
    pub fn ensure_recovery(self: &Arc<Self>) {
        if self.recovery_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            let period = this.ctx.config.recovery_interval;
            loop {
                tokio::select! {
                    _ = sleep(period) => {}
                    _ = this.ctx.stopped() => break,
                }
                this.recover().await;
            }
        });
    }

    /// Ask the closest known peers for their closest contacts to us and
    /// merge the answers into the routing table.
    pub async fn recover(self: &Arc<Self>) {
        let ctx = &self.ctx;
        if ctx.is_stopped() {
            return;
        }
        let local_id = ctx.local.node_id;
        let closest = ctx.closest_contacts(&local_id, ctx.config.parallelism).await;
        trace!(peers = closest.len(), "running recovery scan");
        let responses = join_all(closest.iter().map(|peer| ctx.rpc.find_node(peer, local_id))).await;
        for (peer, response) in closest.into_iter().zip(responses) {
            match response {
                Ok(contacts) => {
                    for contact in contacts {
                        ctx.observe_contact(contact).await;
                    }
                }
                Err(err) => {
                    debug!(peer = %peer.short_id(), error = %err, "recovery request failed");
                    ctx.remove_contact(&peer.node_id).await;
                }
            }
        }

        if ctx.routing_table_is_empty().await {
            let entry = {
                let known = self.entry_points.lock().unwrap_or_else(|p| p.into_inner());
                known
                    .iter()
                    .filter(|e| e.node_id != local_id)
                    .min_by(|a, b| closer_to(&local_id, &a.node_id, &b.node_id))
                    .cloned()
            };
            if let Some(entry) = entry {
                warn!(entry = %short_id(&entry.node_id), "routing table emptied, rejoining");
                self.spawn_rejoin(entry);
            }
        }
    }
}
