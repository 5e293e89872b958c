//! Replication counters, exposed the same way the rest of this workspace
//! exposes runtime health: plain atomics, no locking, cheap enough to bump
//! on every write.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    bytes_propagated: AtomicU64,
    full_resyncs: AtomicU64,
    partial_resyncs: AtomicU64,
    partial_resync_denials: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_propagated(&self, bytes: usize) {
        self.bytes_propagated
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_full_resync(&self) {
        self.full_resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_resync(&self) {
        self.partial_resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_resync_denied(&self) {
        self.partial_resync_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_propagated(&self) -> u64 {
        self.bytes_propagated.load(Ordering::Relaxed)
    }

    pub fn full_resyncs(&self) -> u64 {
        self.full_resyncs.load(Ordering::Relaxed)
    }

    pub fn partial_resyncs(&self) -> u64 {
        self.partial_resyncs.load(Ordering::Relaxed)
    }

    pub fn partial_resync_denials(&self) -> u64 {
        self.partial_resync_denials.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_accumulate() {
        let s = Stats::new();
        assert_eq!(s.bytes_propagated(), 0);
        s.record_propagated(10);
        s.record_propagated(5);
        assert_eq!(s.bytes_propagated(), 15);
        s.record_full_resync();
        s.record_partial_resync();
        s.record_partial_resync_denied();
        assert_eq!(s.full_resyncs(), 1);
        assert_eq!(s.partial_resyncs(), 1);
        assert_eq!(s.partial_resync_denials(), 1);
    }
}
