//! Vector clocks.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::ReplicaId;

/// A per-replica counter vector capturing causal history.
///
/// Every cluster member gets a slot at construction; slots absent from a
/// foreign clock read as 0 when comparing, so deserialised partial state
/// compares correctly.
///
/// Ordering is the standard strict definition: `a < b` iff every slot of
/// `a` is `<=` the matching slot of `b` and at least one is strictly less.
/// Equal clocks are neither less nor greater nor concurrent. Incomparable
/// clocks ([`concurrent`](Self::concurrent)) yield `None` from
/// `partial_cmp`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    slots: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    /// A zeroed clock with a slot for every given replica.
    pub fn new(replicas: impl IntoIterator<Item = ReplicaId>) -> Self {
        Self {
            slots: replicas.into_iter().map(|id| (id, 0)).collect(),
        }
    }

    /// The timestamp of `id`; 0 for an absent slot.
    pub fn get(&self, id: ReplicaId) -> u64 {
        self.slots.get(&id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, id: ReplicaId, timestamp: u64) {
        self.slots.insert(id, timestamp);
    }

    /// True iff neither clock happened before the other and they are not
    /// equal.
    pub fn concurrent(&self, other: &Self) -> bool {
        self.partial_cmp(other).is_none()
    }

    fn ids(&self, other: &Self) -> impl Iterator<Item = ReplicaId> {
        let mut ids: Vec<ReplicaId> = self.slots.keys().chain(other.slots.keys()).copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter()
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.ids(other).all(|id| self.get(id) == other.get(id))
    }
}

impl Eq for VectorClock {}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let mut less = false;
        let mut greater = false;
        for id in self.ids(other) {
            match self.get(id).cmp(&other.get(id)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        match (less, greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }
}
