//! The last-writer-wins add/remove store.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::causal::vclock::VectorClock;
use crate::ReplicaId;

/// An accepted insert: originator, its clock at broadcast time, the value.
pub type InsertRecord = (ReplicaId, VectorClock, i64);
/// An accepted delete: originator and its clock at broadcast time.
pub type RemoveRecord = (ReplicaId, VectorClock);

/// A serialisable copy of the full store, exchanged by the anti-entropy
/// syncer. Merging one in goes through the normal acceptance rules, so the
/// merge is idempotent and commutative.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub inserts: BTreeMap<String, InsertRecord>,
    pub removes: BTreeMap<String, RemoveRecord>,
}

/// Two parallel maps: accepted inserts and accepted deletes (tombstones),
/// at most one record per key each. A key's visible value is decided by
/// comparing the two records under the same total order used for writes.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LwwStore {
    inserts: BTreeMap<String, InsertRecord>,
    removes: BTreeMap<String, RemoveRecord>,
}

/// The total-order rule: a new record replaces the current one iff its
/// clock strictly dominates, or the clocks are concurrent and the new
/// originator has the higher ID.
fn wins(new_origin: ReplicaId, new_clock: &VectorClock, cur_origin: ReplicaId, cur_clock: &VectorClock) -> bool {
    match new_clock.partial_cmp(cur_clock) {
        Some(Ordering::Greater) => true,
        None => new_origin > cur_origin,
        _ => false,
    }
}

impl LwwStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an insert if it beats the current insert record for the key.
    pub fn put(&mut self, key: &str, value: i64, origin: ReplicaId, clock: VectorClock) {
        if let Some((cur_origin, cur_clock, _)) = self.inserts.get(key) {
            if !wins(origin, &clock, *cur_origin, cur_clock) {
                tracing::debug!(key, origin, "insert loses to current record, discarding");
                return;
            }
        }
        self.inserts.insert(key.to_owned(), (origin, clock, value));
    }

    /// Record a delete if it beats the current tombstone for the key.
    pub fn delete(&mut self, key: &str, origin: ReplicaId, clock: VectorClock) {
        if let Some((cur_origin, cur_clock)) = self.removes.get(key) {
            if !wins(origin, &clock, *cur_origin, cur_clock) {
                tracing::debug!(key, origin, "delete loses to current tombstone, discarding");
                return;
            }
        }
        self.removes.insert(key.to_owned(), (origin, clock));
    }

    /// Read a key: the insert record's value, unless the tombstone
    /// dominates it under the same rule writes are ordered by.
    pub fn get(&self, key: &str) -> Option<i64> {
        let (ins_origin, ins_clock, value) = self.inserts.get(key)?;
        match self.removes.get(key) {
            None => Some(*value),
            Some((rm_origin, rm_clock)) => {
                let removed = match ins_clock.partial_cmp(rm_clock) {
                    Some(Ordering::Less) => true,
                    None => ins_origin < rm_origin,
                    _ => false,
                };
                if removed {
                    None
                } else {
                    Some(*value)
                }
            }
        }
    }

    /// Copy the full store for gossiping.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            inserts: self.inserts.clone(),
            removes: self.removes.clone(),
        }
    }

    /// Merge a peer's snapshot through the normal acceptance rules.
    pub fn merge(&mut self, snapshot: StoreSnapshot) {
        for (key, (origin, clock, value)) in snapshot.inserts {
            self.put(&key, value, origin, clock);
        }
        for (key, (origin, clock)) in snapshot.removes {
            self.delete(&key, origin, clock);
        }
    }
}
