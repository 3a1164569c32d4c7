use std::collections::HashSet;

use crate::core::identifier::{Contact, Distance, NodeID};
use crate::core::storage::Value;
use crate::core::K;

/// Which request kind a lookup issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    Node,  // FIND_NODE
    Value, // FIND_VALUE
}

/// What a lookup converged on.
#[derive(Debug)]
pub enum LookupOutcome {
    /// A FIND_VALUE hit, plus the closest probed peer that answered with
    /// contacts instead of the value. That peer gets the value pushed to it
    /// so the next lookup stops one hop earlier.
    Value {
        value: Value,
        nearest_miss: Option<Contact>,
    },
    /// The closest contacts found, ascending by distance to the target.
    Closest(Vec<Contact>),
}

/// The transient candidate set of one lookup: contacts sorted by distance to
/// the target, capped at K, with the set of peers already probed. One lookup
/// owns its shortlist; nothing here is shared.
#[derive(Debug)]
pub struct Shortlist {
    target: NodeID,
    me: NodeID,
    entries: Vec<Contact>,
    probed: HashSet<NodeID>,
    failed: HashSet<NodeID>,
    non_holders: Vec<Contact>,
}

impl Shortlist {
    pub fn new(me: NodeID, target: NodeID, seed: Vec<Contact>) -> Self {
        let mut shortlist = Shortlist {
            target,
            me,
            entries: Vec::new(),
            probed: HashSet::new(),
            failed: HashSet::new(),
            non_holders: Vec::new(),
        };
        shortlist.merge(seed);
        shortlist
    }

    /// Fold newly learned contacts in: score each against the target, drop
    /// ourselves and duplicates, re-sort, keep the best K.
    pub fn merge(&mut self, contacts: Vec<Contact>) {
        for mut contact in contacts {
            if contact.node_id == self.me || self.failed.contains(&contact.node_id) {
                continue;
            }
            if self.entries.iter().any(|e| e.node_id == contact.node_id) {
                continue;
            }
            contact.score(&self.target);
            self.entries.push(contact);
        }
        self.entries
            .sort_by_key(|c| c.distance.unwrap_or(Distance::MAX));
        self.entries.truncate(K);
    }

    /// Up to `n` not-yet-probed contacts, closest first.
    pub fn next_unprobed(&self, n: usize) -> Vec<Contact> {
        self.entries
            .iter()
            .filter(|c| !self.probed.contains(&c.node_id))
            .take(n)
            .copied()
            .collect()
    }

    pub fn mark_probed(&mut self, id: NodeID) {
        self.probed.insert(id);
    }

    /// Drop a peer that failed to answer; it cannot re-enter through a later
    /// reply that still lists it.
    pub fn remove(&mut self, id: NodeID) {
        self.failed.insert(id);
        self.entries.retain(|c| c.node_id != id);
    }

    /// Distance of the current best candidate.
    pub fn closest_distance(&self) -> Option<Distance> {
        self.entries.first().and_then(|c| c.distance)
    }

    /// Record a peer that answered a FIND_VALUE with contacts rather than
    /// the value itself.
    pub fn record_non_holder(&mut self, peer: Contact) {
        if peer.node_id == self.me {
            return;
        }
        if !self.non_holders.iter().any(|c| c.node_id == peer.node_id) {
            self.non_holders.push(peer);
        }
    }

    /// The closest recorded non-holder to the target, if any.
    pub fn nearest_non_holder(&self) -> Option<Contact> {
        self.non_holders
            .iter()
            .min_by_key(|c| c.node_id.distance(&self.target))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The final result: up to K contacts in ascending distance order.
    pub fn into_entries(self) -> Vec<Contact> {
        self.entries
    }
}
