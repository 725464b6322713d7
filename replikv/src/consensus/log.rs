//! The replicated log.

use std::convert::TryFrom;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// The kind of operation a log entry carries.
///
/// Integer-tagged on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventKind {
    Noop = 0,
    Get = 1,
    Post = 2,
    Put = 3,
    Delete = 4,
}

/// Error produced when a wire frame carries an event tag outside the known
/// range. Surfaces as a decode failure, i.e. a malformed datagram.
#[derive(Debug)]
pub struct UnknownEventKind(pub u8);

impl fmt::Display for UnknownEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event kind tag {}", self.0)
    }
}

impl From<EventKind> for u8 {
    fn from(kind: EventKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for EventKind {
    type Error = UnknownEventKind;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(EventKind::Noop),
            1 => Ok(EventKind::Get),
            2 => Ok(EventKind::Post),
            3 => Ok(EventKind::Put),
            4 => Ok(EventKind::Delete),
            other => Err(UnknownEventKind(other)),
        }
    }
}

/// A single log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The term under which the entry was created at the leader.
    pub term: u64,
    pub event: EventKind,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<i64>,
}

impl Entry {
    /// Create a blank entry; new leaders append one when coming to power,
    /// and index 0 of every log holds one as the sentinel.
    pub fn noop(term: u64) -> Self {
        Self {
            term,
            event: EventKind::Noop,
            key: None,
            value: None,
        }
    }
}

/// The append-only ordered entry sequence.
///
/// Index 0 always holds the `{term: 0, Noop}` sentinel, so `size() >= 1` and
/// every real entry has a predecessor to check consistency against. Terms
/// are non-decreasing along the log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Log {
    entries: Vec<Entry>,
}

impl Log {
    pub fn new() -> Self {
        Self {
            entries: vec![Entry::noop(0)],
        }
    }

    /// Current length, sentinel included.
    pub fn size(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Indexed access. Panics if `index >= size()`; callers only index
    /// positions they have established exist.
    pub fn get(&self, index: u64) -> &Entry {
        &self.entries[index as usize]
    }

    /// The entry at the tail of the log.
    pub fn last(&self) -> &Entry {
        self.entries.last().expect("log holds at least the sentinel")
    }

    /// Append `entry` after position `prev_idx`, subject to the consistency
    /// check that `prev_idx` exists and carries `prev_term`.
    ///
    /// Returns false if the check fails. On success with `entry == None`
    /// (a heartbeat probe) nothing changes. Otherwise the entry lands at
    /// `prev_idx + 1`: appended if that position is the tail, skipped if an
    /// entry of the same term already sits there, and replacing the whole
    /// divergent suffix if the terms differ.
    pub fn append(&mut self, entry: Option<Entry>, prev_idx: u64, prev_term: u64) -> bool {
        if prev_idx >= self.size() || self.entries[prev_idx as usize].term != prev_term {
            tracing::debug!(prev_idx, prev_term, "previous entry missing or inconsistent, rejecting");
            return false;
        }
        let entry = match entry {
            Some(entry) => entry,
            None => return true,
        };
        let next = (prev_idx + 1) as usize;
        if next == self.entries.len() {
            self.entries.push(entry);
        } else if self.entries[next].term != entry.term {
            tracing::debug!(index = next, "divergent suffix, truncating");
            self.entries.truncate(next);
            self.entries.push(entry);
        }
        true
    }

    /// All entries, for state snapshots.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn put(term: u64, key: &str, value: i64) -> Entry {
        Entry {
            term,
            event: EventKind::Put,
            key: Some(key.into()),
            value: Some(value),
        }
    }

    #[test]
    fn starts_with_sentinel() {
        let log = Log::new();
        assert_eq!(log.size(), 1);
        assert_eq!(log.get(0).term, 0);
        assert_eq!(log.get(0).event, EventKind::Noop);
    }

    #[test]
    fn append_at_tail() {
        let mut log = Log::new();
        assert!(log.append(Some(put(1, "a", 1)), 0, 0));
        assert!(log.append(Some(put(1, "b", 2)), 1, 1));
        assert_eq!(log.size(), 3);
        assert_eq!(log.get(2).key.as_deref(), Some("b"));
    }

    #[test]
    fn rejects_missing_or_mismatched_previous() {
        let mut log = Log::new();
        assert!(!log.append(Some(put(1, "a", 1)), 5, 0), "prev beyond tail");
        assert!(!log.append(Some(put(1, "a", 1)), 0, 3), "prev term mismatch");
        assert_eq!(log.size(), 1);
    }

    #[test]
    fn heartbeat_probe_checks_without_mutating() {
        let mut log = Log::new();
        assert!(log.append(Some(put(1, "a", 1)), 0, 0));
        assert!(log.append(None, 1, 1));
        assert!(!log.append(None, 1, 9));
        assert_eq!(log.size(), 2);
    }

    #[test]
    fn duplicate_same_term_is_idempotent() {
        let mut log = Log::new();
        assert!(log.append(Some(put(1, "a", 1)), 0, 0));
        assert!(log.append(Some(put(1, "a", 1)), 0, 0));
        assert_eq!(log.size(), 2);
        assert_eq!(log.get(1).value, Some(1));
    }

    #[test]
    fn truncates_divergent_suffix() {
        let mut log = Log::new();
        assert!(log.append(Some(put(1, "a", 1)), 0, 0));
        assert!(log.append(Some(put(1, "b", 2)), 1, 1));
        assert!(log.append(Some(put(1, "c", 3)), 2, 1));
        // A new leader at term 2 overwrites from index 2 onward.
        assert!(log.append(Some(put(2, "x", 9)), 1, 1));
        assert_eq!(log.size(), 3);
        assert_eq!(log.get(2).key.as_deref(), Some("x"));
        assert_eq!(log.get(2).term, 2);
    }

    #[test]
    fn event_kind_wire_tags() {
        assert_eq!(serde_json::to_string(&EventKind::Delete).unwrap(), "4");
        let kind: EventKind = serde_json::from_str("2").unwrap();
        assert_eq!(kind, EventKind::Post);
        assert!(serde_json::from_str::<EventKind>("9").is_err());
    }
}
