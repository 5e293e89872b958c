//! Minimal stream representation.
//!
//! Streams are one of the seven logical types `Object` must be able to tag
//! and carry through the RDB codec, but command-level semantics (XADD
//! trimming strategies, consumer group ack/claim commands) are out of
//! scope; this module gives just enough structure for values to round-trip
//! through save/load and for `OBJECT ENCODING` to report `stream`.

use std::collections::{BTreeMap, HashMap};

/// `<ms>-<seq>` entry ID, ordered the same way the wire protocol compares
/// them: by milliseconds, then by sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamEntryId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamEntryId {
    pub const MIN: StreamEntryId = StreamEntryId { ms: 0, seq: 0 };

    pub fn next(self) -> StreamEntryId {
        StreamEntryId {
            ms: self.ms,
            seq: self.seq + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub consumer: String,
    pub delivery_time: u64,
    pub delivery_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Consumer {
    pub seen_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumerGroup {
    pub last_delivered_id: Option<StreamEntryId>,
    pub consumers: HashMap<String, Consumer>,
    pub pending: BTreeMap<StreamEntryId, PendingEntry>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamRepr {
    pub entries: BTreeMap<StreamEntryId, Vec<(Vec<u8>, Vec<u8>)>>,
    pub last_id: StreamEntryId,
    pub max_deleted_id: StreamEntryId,
    pub entries_added: u64,
    pub groups: HashMap<String, ConsumerGroup>,
}

impl StreamRepr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a new entry after `last_id`, returning its assigned id.
    pub fn append(&mut self, ms: u64, fields: Vec<(Vec<u8>, Vec<u8>)>) -> StreamEntryId {
        let id = if ms > self.last_id.ms {
            StreamEntryId { ms, seq: 0 }
        } else {
            self.last_id.next()
        };
        self.entries.insert(id, fields);
        self.last_id = id;
        self.entries_added += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_assigns_monotonic_ids() {
        let mut s = StreamRepr::new();
        let a = s.append(100, vec![(b"f".to_vec(), b"v".to_vec())]);
        let b = s.append(100, vec![(b"f".to_vec(), b"v2".to_vec())]);
        assert_eq!(a, StreamEntryId { ms: 100, seq: 0 });
        assert_eq!(b, StreamEntryId { ms: 100, seq: 1 });
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn append_advances_ms() {
        let mut s = StreamRepr::new();
        s.append(100, vec![]);
        let b = s.append(200, vec![]);
        assert_eq!(b, StreamEntryId { ms: 200, seq: 0 });
    }
}
