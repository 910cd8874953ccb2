//! Packet type to listener multimap.
//!
//! Aggregates one [`SortedCopyOnWriteSet`] per packet type. Lookups go through a
//! `DashMap` and return snapshot iterators, so dispatch never waits on a
//! registration in progress.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::listener::{ListenerPriority, ListeningWhitelist};
use crate::protocol::PacketType;

use super::sorted_set::{Snapshot, SnapshotIter, SortedCopyOnWriteSet};

/// Multimap from packet type to listeners ordered by priority.
#[derive(Debug)]
pub struct PacketTypeMultiMap<T> {
    types: DashMap<PacketType, Arc<SortedCopyOnWriteSet<T, ListenerPriority>>>,
    write_lock: Mutex<()>,
}

impl<T> PacketTypeMultiMap<T>
where
    T: Clone + PartialEq,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Index `value` under every packet type of `whitelist`.
    pub fn put(&self, whitelist: &ListeningWhitelist, value: T) {
        let _guard = self.write_lock.lock();
        for packet_type in whitelist.types() {
            let set = self
                .types
                .entry(*packet_type)
                .or_insert_with(|| Arc::new(SortedCopyOnWriteSet::new()))
                .clone();
            set.add(value.clone(), whitelist.priority());
        }
    }

    /// Remove `value` from every packet type of `whitelist`.
    ///
    /// Returns the packet types that no longer have any listener.
    pub fn remove(&self, whitelist: &ListeningWhitelist, value: &T) -> Vec<PacketType> {
        let _guard = self.write_lock.lock();
        let mut removed_types = Vec::new();

        for packet_type in whitelist.types() {
            let Some(set) = self.types.get(packet_type).map(|entry| Arc::clone(entry.value())) else {
                continue;
            };

            if !set.remove(value) {
                continue;
            }

            if set.is_empty() {
                self.types.remove(packet_type);
                removed_types.push(*packet_type);
            }
        }

        removed_types
    }

    /// Listeners for `packet_type` in dispatch order.
    ///
    /// Unknown types yield an empty iterator.
    #[must_use]
    pub fn get(&self, packet_type: &PacketType) -> SnapshotIter<T> {
        match self.types.get(packet_type) {
            Some(set) => set.iter(),
            None => SnapshotIter::empty(),
        }
    }

    /// Ordered snapshot of the listeners for `packet_type`.
    #[must_use]
    pub fn snapshot(&self, packet_type: &PacketType) -> Snapshot<T> {
        match self.types.get(packet_type) {
            Some(set) => set.snapshot(),
            None => Arc::from(Vec::new()),
        }
    }

    /// Whether any listener is registered for `packet_type`.
    #[must_use]
    pub fn contains(&self, packet_type: &PacketType) -> bool {
        self.types.contains_key(packet_type)
    }

    /// Every packet type with at least one listener.
    #[must_use]
    pub fn packet_types(&self) -> BTreeSet<PacketType> {
        self.types.iter().map(|entry| *entry.key()).collect()
    }

    /// Every listener across all packet types.
    ///
    /// A listener registered for several types appears once per type.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.types
            .iter()
            .flat_map(|entry| entry.value().snapshot().to_vec())
            .collect()
    }

    /// Remove every listener.
    pub fn clear(&self) {
        let _guard = self.write_lock.lock();
        self.types.clear();
    }
}

impl<T> Default for PacketTypeMultiMap<T>
where
    T: Clone + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}
