//! Kademlia routing table.

use crate::descriptor::PeerDescriptor;
use crate::identifier::{bucket_index, closer_to, NodeId, ID_LEN};

/// Up to `k` contacts sharing one prefix length with the local id.
///
/// Long-lived contacts win over newcomers: a full bucket only admits a new
/// contact after its oldest entry fails a ping.
#[derive(Debug, Default, Clone)]
struct Bucket {
    /// Least recently seen first.
    contacts: Vec<PeerDescriptor>,
}

/// Outcome of attempting to add or refresh a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketTouchOutcome {
    /// Added to a bucket with room.
    Inserted,
    /// Already known; moved to the most recently seen slot.
    Refreshed,
    /// The contact is the local node.
    Ignored,
    /// Bucket is full; the oldest contact must be pinged before eviction.
    Full(PendingBucketUpdate),
}

/// A contact waiting on the liveness of a full bucket's oldest entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingBucketUpdate {
    bucket_index: usize,
    pub oldest: PeerDescriptor,
    pub new_contact: PeerDescriptor,
}

/// What changed after a ping-before-evict check.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EvictionResult {
    pub removed: Option<PeerDescriptor>,
    pub inserted: Option<PeerDescriptor>,
}

impl Bucket {
    fn touch(&mut self, contact: PeerDescriptor, k: usize, bucket_index: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.contacts.iter().position(|c| c.node_id == contact.node_id) {
            self.contacts.remove(pos);
            // keep the freshest descriptor, addresses may have changed
            self.contacts.push(contact);
            return BucketTouchOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push(contact);
            return BucketTouchOutcome::Inserted;
        }

        match self.contacts.first().cloned() {
            Some(oldest) => BucketTouchOutcome::Full(PendingBucketUpdate {
                bucket_index,
                oldest,
                new_contact: contact,
            }),
            None => BucketTouchOutcome::Ignored,
        }
    }

    fn refresh(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.node_id == id) {
            let seen = self.contacts.remove(pos);
            self.contacts.push(seen);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &NodeId) -> Option<PeerDescriptor> {
        let pos = self.contacts.iter().position(|c| &c.node_id == id)?;
        Some(self.contacts.remove(pos))
    }
}

/// Contacts of the local node, one bucket per shared-prefix length.
///
/// Each bucket stores up to k contacts at a specific XOR distance from the
/// local node. The table never holds the local node itself.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, k: usize) -> Self {
        Self {
            self_id,
            k,
            buckets: vec![Bucket::default(); ID_LEN * 8],
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Add or refresh a contact.
    ///
    /// When the target bucket is full the caller receives the pending update
    /// and is expected to ping the oldest contact, then call
    /// [`apply_ping_result`](Self::apply_ping_result).
    pub fn update(&mut self, contact: PeerDescriptor) -> BucketTouchOutcome {
        if contact.node_id == self.self_id {
            return BucketTouchOutcome::Ignored;
        }
        let idx = bucket_index(&self.self_id, &contact.node_id);
        self.buckets[idx].touch(contact, self.k, idx)
    }

    /// Settle a [`PendingBucketUpdate`] once the oldest contact answered or not.
    pub fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) -> EvictionResult {
        let k = self.k;
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.node_id);
            return EvictionResult::default();
        }

        let removed = bucket.remove(&pending.oldest.node_id);
        let already_present = bucket
            .contacts
            .iter()
            .any(|c| c.node_id == pending.new_contact.node_id);
        let mut inserted = None;
        if !already_present && bucket.contacts.len() < k {
            bucket.contacts.push(pending.new_contact.clone());
            inserted = Some(pending.new_contact);
        }
        EvictionResult { removed, inserted }
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<PeerDescriptor> {
        if id == &self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].remove(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx].contacts.iter().any(|c| &c.node_id == id)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.contacts.is_empty())
    }

    pub fn all(&self) -> Vec<PeerDescriptor> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }

    /// Find the `n` closest contacts to a target id.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<PeerDescriptor> {
        let mut all = self.all();
        all.sort_by(|a, b| closer_to(target, &a.node_id, &b.node_id));
        all.truncate(n);
        all
    }
}
