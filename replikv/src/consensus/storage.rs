//! The key/value state machine driven by committed log entries.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::consensus::log::Entry;
use crate::consensus::log::EventKind;

/// The map committed entries are applied to.
///
/// Each committed entry is applied exactly once, in index order, which makes
/// `apply` trivially idempotent per log index. Reads are routed through the
/// log as `Get` entries, so the value returned here reflects every write
/// committed before the read.
#[derive(Debug, Default, Clone, Serialize)]
pub struct StateMachine {
    storage: BTreeMap<String, i64>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one committed entry. Only `Get` produces a value.
    pub fn apply(&mut self, entry: &Entry) -> Option<i64> {
        tracing::debug!(?entry, "apply entry");
        match entry.event {
            EventKind::Noop => None,
            EventKind::Get => entry.key.as_deref().and_then(|key| self.get(key)),
            EventKind::Post | EventKind::Put => {
                match (&entry.key, entry.value) {
                    (Some(key), Some(value)) => {
                        self.storage.insert(key.clone(), value);
                    }
                    _ => tracing::error!(?entry, "write entry without key and value"),
                }
                None
            }
            EventKind::Delete => {
                match &entry.key {
                    // Removing an absent key is a no-op.
                    Some(key) => {
                        self.storage.remove(key);
                    }
                    None => tracing::error!(?entry, "delete entry without key"),
                }
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.storage.get(key).copied()
    }

    /// The full map, for state snapshots.
    pub fn data(&self) -> &BTreeMap<String, i64> {
        &self.storage
    }
}
