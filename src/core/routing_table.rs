use std::collections::VecDeque;

use tracing::debug;

use super::identifier::{Contact, Distance, NodeID};
use super::{K, NUM_BUCKETS};

/// A bounded LRU list of contacts for one distance class.
/// The least-recently-seen peer sits at the front, the most recent at the back.
#[derive(Debug, Default)]
pub struct KBucket {
    contacts: VecDeque<Contact>,
}

impl KBucket {
    fn new() -> Self {
        Self {
            contacts: VecDeque::with_capacity(K),
        }
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= K
    }

    pub fn contains(&self, id: NodeID) -> bool {
        self.position(id).is_some()
    }

    /// The least-recently-seen contact, the eviction candidate when full.
    pub fn first(&self) -> Option<&Contact> {
        self.contacts.front()
    }

    pub fn back(&self) -> Option<&Contact> {
        self.contacts.back()
    }

    fn position(&self, id: NodeID) -> Option<usize> {
        self.contacts.iter().position(|c| c.node_id == id)
    }

    fn push_back(&mut self, contact: Contact) {
        debug_assert!(!self.is_full(), "push into a full bucket");
        self.contacts.push_back(contact);
    }

    /// Move an existing entry to the most-recently-seen slot, observing any
    /// address change along the way. NodeID stays the identity.
    fn refresh(&mut self, peer: Contact) -> bool {
        let Some(pos) = self.position(peer.node_id) else {
            return false;
        };
        let mut entry = self.contacts.remove(pos).unwrap();
        entry.address = peer.address;
        self.contacts.push_back(entry);
        true
    }

    fn move_to_back(&mut self, id: NodeID) -> bool {
        if let Some(pos) = self.position(id) {
            let entry = self.contacts.remove(pos).unwrap();
            self.contacts.push_back(entry);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: NodeID) -> bool {
        if let Some(pos) = self.position(id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }

    fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter()
    }
}

/// Outcome of offering a contact to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Appended as the most recently seen entry of its bucket.
    Inserted,
    /// Already present; moved to the back, address updated.
    Refreshed,
    /// The bucket is at capacity. The least-recently-seen entry needs a
    /// liveness probe before anything changes; see [`RoutingTable::resolve_probe`].
    Full { lru: Contact },
    /// Our own ID, never stored.
    Ignored,
}

/// 160 k-buckets indexed by the highest differing bit between our ID and a
/// peer's. The table never does I/O itself: a full bucket surfaces its LRU
/// entry and the caller reports the probe outcome back.
#[derive(Debug)]
pub struct RoutingTable {
    me: Contact,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(me: Contact) -> Self {
        Self {
            me,
            buckets: (0..NUM_BUCKETS).map(|_| KBucket::new()).collect(),
        }
    }

    pub fn me(&self) -> &Contact {
        &self.me
    }

    fn bucket_of(&self, id: NodeID) -> usize {
        self.me.node_id.bucket_index(&id)
    }

    pub fn try_insert(&mut self, peer: Contact) -> InsertResult {
        if peer.node_id == self.me.node_id {
            return InsertResult::Ignored;
        }
        let index = self.bucket_of(peer.node_id);
        let bucket = &mut self.buckets[index];
        if bucket.refresh(peer) {
            return InsertResult::Refreshed;
        }
        if bucket.is_full() {
            let lru = *bucket.first().unwrap();
            return InsertResult::Full { lru };
        }
        bucket.push_back(peer);
        InsertResult::Inserted
    }

    /// Settle a [`InsertResult::Full`] after pinging the LRU entry. A live
    /// LRU keeps its slot and the newcomer is dropped; a dead one is evicted
    /// and the newcomer takes the back of the bucket.
    pub fn resolve_probe(&mut self, lru: Contact, candidate: Contact, alive: bool) {
        let index = self.bucket_of(lru.node_id);
        let bucket = &mut self.buckets[index];
        if alive {
            bucket.move_to_back(lru.node_id);
            return;
        }
        debug!(evicted = %lru.node_id.short_hex(), "dead peer evicted from its bucket");
        bucket.remove(lru.node_id);
        if candidate.node_id != self.me.node_id
            && !bucket.is_full()
            && !bucket.contains(candidate.node_id)
        {
            bucket.push_back(candidate);
        }
    }

    pub fn remove_contact(&mut self, id: NodeID) -> bool {
        if id == self.me.node_id {
            return false;
        }
        let index = self.bucket_of(id);
        self.buckets[index].remove(id)
    }

    pub fn contains(&self, id: NodeID) -> bool {
        self.find(id).is_some()
    }

    pub fn find(&self, id: NodeID) -> Option<&Contact> {
        if id == self.me.node_id {
            return None;
        }
        let index = self.bucket_of(id);
        self.buckets[index].iter().find(|c| c.node_id == id)
    }

    /// The `n` known contacts closest to `target` by XOR distance, ascending.
    /// Scans every bucket and sorts; fine at K * 160 entries.
    pub fn find_closest(&self, target: &NodeID, n: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .copied()
            .collect();
        for contact in &mut all {
            contact.score(target);
        }
        all.sort_by_key(|c| c.distance.unwrap_or(Distance::MAX));
        all.truncate(n);
        all
    }

    pub fn peer_count(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets[index].len()
    }

    /// Indexes of buckets currently holding at least one contact.
    pub fn non_empty_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    #[cfg(test)]
    fn bucket(&self, index: usize) -> &KBucket {
        &self.buckets[index]
    }
}
