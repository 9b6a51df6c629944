//! The per-node membership table.
//!
//! Maps every known listen address (self included) to the identity that
//! announced it. The table only ever grows: a peer that stops answering
//! stays listed, and failure is discovered at send time instead of being
//! recorded here. A `BTreeMap` keeps iteration deterministic, which keeps
//! election logs and tests predictable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::{Identity, ListenAddress};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembershipTable {
    entries: BTreeMap<ListenAddress, Identity>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an address if it is not already known. Identities are stable
    /// per address within a run, so an existing entry is never overwritten.
    /// Returns whether the entry was added.
    pub fn insert(&mut self, addr: ListenAddress, identity: Identity) -> bool {
        if self.entries.contains_key(&addr) {
            return false;
        }
        self.entries.insert(addr, identity);
        true
    }

    /// Merges every unknown entry of `other` into this table. Returns how
    /// many entries were added.
    pub fn merge(&mut self, other: &MembershipTable) -> usize {
        let mut added = 0;
        for (addr, identity) in &other.entries {
            if self.insert(addr.clone(), *identity) {
                added += 1;
            }
        }
        added
    }

    /// All entries whose identity is strictly greater than `than`. These are
    /// the only peers an election wave may target.
    pub fn higher_peers(&self, than: Identity) -> Vec<(ListenAddress, Identity)> {
        self.entries
            .iter()
            .filter(|(_, identity)| **identity > than)
            .map(|(addr, identity)| (addr.clone(), *identity))
            .collect()
    }

    /// Every address except `addr` itself, for broadcast.
    pub fn peers_except(&self, addr: &ListenAddress) -> Vec<ListenAddress> {
        self.entries
            .keys()
            .filter(|known| *known != addr)
            .cloned()
            .collect()
    }

    /// All addresses a given identity has announced. Usually one; a node
    /// that feigned failure and recovered on a new port leaves its old
    /// address behind as a dead entry.
    pub fn addresses_of(&self, identity: Identity) -> Vec<ListenAddress> {
        self.entries
            .iter()
            .filter(|(_, known)| **known == identity)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ListenAddress, &Identity)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> ListenAddress {
        ListenAddress::new("localhost", port)
    }

    #[test]
    fn merge_adds_unknown_entries_only() {
        let mut table = MembershipTable::new();
        table.insert(addr(1), Identity::new(10, 100));

        let mut incoming = MembershipTable::new();
        incoming.insert(addr(1), Identity::new(99, 999));
        incoming.insert(addr(2), Identity::new(5, 200));

        assert_eq!(table.merge(&incoming), 1);
        // First write wins: the existing identity for addr 1 is untouched.
        assert_eq!(table.addresses_of(Identity::new(10, 100)), vec![addr(1)]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut table = MembershipTable::new();
        let mut incoming = MembershipTable::new();
        incoming.insert(addr(1), Identity::new(10, 100));
        incoming.insert(addr(2), Identity::new(5, 200));

        assert_eq!(table.merge(&incoming), 2);
        assert_eq!(table.merge(&incoming), 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn higher_peers_is_strict() {
        let mut table = MembershipTable::new();
        table.insert(addr(1), Identity::new(10, 100));
        table.insert(addr(2), Identity::new(10, 200));
        table.insert(addr(3), Identity::new(20, 50));
        table.insert(addr(4), Identity::new(5, 999));

        let higher = table.higher_peers(Identity::new(10, 100));
        let addrs: Vec<_> = higher.iter().map(|(a, _)| a.clone()).collect();
        assert_eq!(addrs, vec![addr(2), addr(3)]);

        // An equal identity on another address is not "higher".
        let mut twin = MembershipTable::new();
        twin.insert(addr(5), Identity::new(10, 100));
        table.merge(&twin);
        assert_eq!(table.higher_peers(Identity::new(10, 100)).len(), 2);
    }

    #[test]
    fn peers_except_drops_only_the_given_address() {
        let mut table = MembershipTable::new();
        table.insert(addr(1), Identity::new(10, 100));
        table.insert(addr(2), Identity::new(5, 200));

        assert_eq!(table.peers_except(&addr(1)), vec![addr(2)]);
        assert_eq!(table.peers_except(&addr(9)).len(), 2);
    }

    #[test]
    fn wire_form_is_a_plain_mapping() {
        let mut table = MembershipTable::new();
        table.insert(addr(60301), Identity::new(10, 100));

        let encoded = serde_json::to_value(&table).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!({ "localhost:60301": [10, 100] })
        );
        let decoded: MembershipTable = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, table);
    }
}
