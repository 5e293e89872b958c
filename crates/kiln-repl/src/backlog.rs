//! The replication backlog: a fixed-size ring of the most recently
//! propagated bytes, kept so a replica that merely dropped its connection
//! (rather than falling fatally behind) can resume with `PSYNC <replid>
//! <offset>` instead of paying for a full resync.
//!
//! `master_repl_offset` counts every byte ever appended, monotonically, for
//! the life of the process (barring a restart). `histlen` is how much of
//! that history the ring currently holds — it grows to `capacity` and then
//! stays there, with each append evicting the oldest byte it overwrites.

use crate::error::ReplError;

pub struct Backlog {
    buf: Vec<u8>,
    capacity: usize,
    /// Index of the oldest byte still held in `buf`.
    start: usize,
    /// Bytes of history currently held, `0..=capacity`.
    histlen: usize,
    /// Total bytes ever appended.
    master_repl_offset: u64,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "backlog capacity must be nonzero");
        Self {
            buf: vec![0; capacity],
            capacity,
            start: 0,
            histlen: 0,
            master_repl_offset: 0,
        }
    }

    pub fn master_repl_offset(&self) -> u64 {
        self.master_repl_offset
    }

    pub fn histlen(&self) -> usize {
        self.histlen
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offset of the oldest byte still available for a partial resync.
    pub fn first_byte_offset(&self) -> u64 {
        self.master_repl_offset - self.histlen as u64
    }

    /// Appends bytes, advancing `master_repl_offset` and overwriting the
    /// oldest history once the ring fills.
    pub fn append(&mut self, data: &[u8]) {
        for &byte in data {
            let write_at = (self.start + self.histlen) % self.capacity;
            self.buf[write_at] = byte;
            if self.histlen < self.capacity {
                self.histlen += 1;
            } else {
                self.start = (self.start + 1) % self.capacity;
            }
        }
        self.master_repl_offset += data.len() as u64;
    }

    /// Returns every byte from `offset` (exclusive of nothing — `offset` is
    /// the offset of the first byte the caller wants) through the current
    /// `master_repl_offset`. Fails if `offset` has already fallen out of
    /// the window, which forces the caller to a full resync instead.
    pub fn read_from(&self, offset: u64) -> Result<Vec<u8>, ReplError> {
        let first = self.first_byte_offset();
        let last = self.master_repl_offset;
        if offset < first || offset > last {
            return Err(ReplError::OffsetOutOfRange {
                requested: offset,
                first,
                last,
            });
        }
        let skip = (offset - first) as usize;
        let len = self.histlen - skip;
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(self.buf[(self.start + skip + i) % self.capacity]);
        }
        Ok(out)
    }

    /// Replaces the backlog with an empty one of the new capacity. Matches
    /// real-world practice of resizing only while no replica depends on the
    /// discarded history (callers must not resize with replicas attached
    /// unless they're prepared to force full resyncs).
    pub fn resize(&mut self, new_capacity: usize) {
        assert!(new_capacity > 0, "backlog capacity must be nonzero");
        self.buf = vec![0; new_capacity];
        self.capacity = new_capacity;
        self.start = 0;
        self.histlen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_advances_offset_and_histlen() {
        let mut b = Backlog::new(16);
        b.append(b"hello");
        assert_eq!(b.master_repl_offset(), 5);
        assert_eq!(b.histlen(), 5);
    }

    #[test]
    fn read_from_start_returns_full_history() {
        let mut b = Backlog::new(16);
        b.append(b"hello");
        assert_eq!(b.read_from(0).unwrap(), b"hello");
    }

    #[test]
    fn read_from_mid_offset_returns_suffix() {
        let mut b = Backlog::new(16);
        b.append(b"hello world");
        assert_eq!(b.read_from(6).unwrap(), b"world");
    }

    #[test]
    fn wraparound_preserves_only_most_recent_capacity_bytes() {
        let mut b = Backlog::new(4);
        b.append(b"abcdef");
        assert_eq!(b.histlen(), 4);
        assert_eq!(b.master_repl_offset(), 6);
        assert_eq!(b.read_from(2).unwrap(), b"cdef");
    }

    #[test]
    fn stale_offset_is_rejected() {
        let mut b = Backlog::new(4);
        b.append(b"abcdef");
        let err = b.read_from(0).unwrap_err();
        assert!(matches!(err, ReplError::OffsetOutOfRange { .. }));
    }

    #[test]
    fn offset_ahead_of_master_is_rejected() {
        let mut b = Backlog::new(16);
        b.append(b"abc");
        assert!(b.read_from(100).is_err());
    }

    #[test]
    fn resize_discards_history_but_keeps_offset() {
        let mut b = Backlog::new(16);
        b.append(b"hello");
        b.resize(32);
        assert_eq!(b.histlen(), 0);
        assert_eq!(b.master_repl_offset(), 5);
    }
}
