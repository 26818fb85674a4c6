//! Distance-sorted contact lists used by lookups and replica placement.
//!
//! Contacts live in an arena of stable slots; the sorted order is a list of
//! slot indices. A discovery session can flip `contacted`/`active` on a slot
//! while the ordering is rebuilt around it.

use std::collections::HashMap;

use crate::descriptor::PeerDescriptor;
use crate::identifier::{closer_to, NodeId};

/// Per-session flags attached to a peer.
#[derive(Clone, Debug)]
pub struct ContactState {
    pub descriptor: PeerDescriptor,
    /// A request has been sent to this peer.
    pub contacted: bool,
    /// The peer answered.
    pub active: bool,
}

impl ContactState {
    fn new(descriptor: PeerDescriptor) -> Self {
        Self {
            descriptor,
            contacted: false,
            active: false,
        }
    }
}

/// Stable index of a contact inside a [`SortedContactList`].
pub type SlotId = usize;

/// Bounded list of contacts ordered by XOR distance to a reference id.
#[derive(Debug)]
pub struct SortedContactList {
    reference: NodeId,
    max_size: usize,
    excluded: Option<NodeId>,
    slots: Vec<Option<ContactState>>,
    free: Vec<SlotId>,
    by_id: HashMap<NodeId, SlotId>,
    order: Vec<SlotId>,
}

impl SortedContactList {
    pub fn new(reference: NodeId, max_size: usize) -> Self {
        Self {
            reference,
            max_size,
            excluded: None,
            slots: Vec::new(),
            free: Vec::new(),
            by_id: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Never admit `id` into the list (typically the local node).
    pub fn excluding(mut self, id: NodeId) -> Self {
        self.excluded = Some(id);
        self
    }

    pub fn reference(&self) -> &NodeId {
        &self.reference
    }

    /// Insert a contact at its sorted position.
    ///
    /// Returns `true` when the contact is new and survived the size bound.
    pub fn add(&mut self, descriptor: PeerDescriptor) -> bool {
        let id = descriptor.node_id;
        if self.excluded == Some(id) || self.by_id.contains_key(&id) {
            return false;
        }

        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(ContactState::new(descriptor));
                slot
            }
            None => {
                self.slots.push(Some(ContactState::new(descriptor)));
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id, slot);

        let reference = self.reference;
        let slots = &self.slots;
        let pos = self.order.partition_point(|existing| {
            let existing_id = slots[*existing]
                .as_ref()
                .map(|c| c.descriptor.node_id)
                .unwrap_or(reference);
            closer_to(&reference, &existing_id, &id).is_lt()
        });
        self.order.insert(pos, slot);

        if self.order.len() > self.max_size {
            if let Some(dropped) = self.order.pop() {
                self.release(dropped);
                return dropped != slot;
            }
        }
        true
    }

    /// Remove a contact, returning its final state.
    pub fn remove(&mut self, id: &NodeId) -> Option<ContactState> {
        let slot = *self.by_id.get(id)?;
        self.order.retain(|s| *s != slot);
        self.release(slot)
    }

    fn release(&mut self, slot: SlotId) -> Option<ContactState> {
        let state = self.slots.get_mut(slot)?.take()?;
        self.by_id.remove(&state.descriptor.node_id);
        self.free.push(slot);
        Some(state)
    }

    pub fn get(&self, id: &NodeId) -> Option<&ContactState> {
        let slot = self.by_id.get(id)?;
        self.slots[*slot].as_ref()
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut ContactState> {
        let slot = self.by_id.get(id)?;
        self.slots[*slot].as_mut()
    }

    pub fn set_contacted(&mut self, id: &NodeId) {
        if let Some(state) = self.get_mut(id) {
            state.contacted = true;
        }
    }

    pub fn set_active(&mut self, id: &NodeId) {
        if let Some(state) = self.get_mut(id) {
            state.active = true;
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn ordered(&self) -> impl Iterator<Item = &ContactState> {
        self.order.iter().filter_map(|slot| self.slots[*slot].as_ref())
    }

    /// Closest contact, if any.
    pub fn first(&self) -> Option<&PeerDescriptor> {
        self.ordered().next().map(|c| &c.descriptor)
    }

    /// Up to `n` closest contacts that have not been queried yet.
    pub fn uncontacted(&self, n: usize) -> Vec<PeerDescriptor> {
        self.ordered()
            .filter(|c| !c.contacted)
            .take(n)
            .map(|c| c.descriptor.clone())
            .collect()
    }

    /// Up to `n` closest contacts that answered.
    pub fn active(&self, n: usize) -> Vec<PeerDescriptor> {
        self.ordered()
            .filter(|c| c.active)
            .take(n)
            .map(|c| c.descriptor.clone())
            .collect()
    }

    pub fn closest(&self, n: usize) -> Vec<PeerDescriptor> {
        self.ordered().take(n).map(|c| c.descriptor.clone()).collect()
    }

    pub fn all(&self) -> Vec<PeerDescriptor> {
        self.ordered().map(|c| c.descriptor.clone()).collect()
    }

    /// Position of `id` in the sorted order.
    pub fn position(&self, id: &NodeId) -> Option<usize> {
        self.ordered().position(|c| &c.descriptor.node_id == id)
    }
}
