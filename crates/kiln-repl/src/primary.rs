//! The primary side of replication: tracks each replica's handshake
//! progress, decides full vs. partial resync, and fans out propagated
//! writes to every replica that has caught up enough to receive them live.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::backlog::Backlog;
use crate::error::ReplError;
use crate::stats::Stats;

pub type ReplicaId = u64;

/// Generates a fresh 40-character hex replication ID, the same width and
/// alphabet as the real protocol's `runid`/`replid` fields.
pub fn generate_replid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

/// Where a connected replica sits in the resync/streaming lifecycle.
/// Mirrors the real handshake: a replica cannot receive live writes until
/// its snapshot has been fully sent and it has come `Online`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    WaitBgsaveStart,
    WaitBgsaveEnd,
    SendBulk,
    /// A diskless full resync finished streaming, but the live-write
    /// handler isn't armed yet: arming it before the replica's first ack
    /// risks interleaving backlog bytes with the EOF sentinel it's still
    /// scanning for. Promotes to `Online` on the next `REPLCONF ACK`.
    OnlinePendingAck,
    Online,
}

pub struct PrimaryReplica {
    pub state: ReplicaState,
    pub ack_offset: u64,
    pub last_ack_time: u64,
    output: Arc<ArrayQueue<Vec<u8>>>,
}

impl PrimaryReplica {
    fn new(output_capacity: usize) -> Self {
        Self {
            state: ReplicaState::WaitBgsaveStart,
            ack_offset: 0,
            last_ack_time: 0,
            output: Arc::new(ArrayQueue::new(output_capacity)),
        }
    }

    pub fn output_handle(&self) -> Arc<ArrayQueue<Vec<u8>>> {
        Arc::clone(&self.output)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsyncDecision {
    /// Replica must receive a fresh snapshot; carries the replid and
    /// offset it should resume streaming from once the snapshot lands.
    FullResync { replid: String, offset: u64 },
    /// Replica's offset is still inside the backlog window; `tail` is the
    /// history it missed while disconnected, to be sent before live
    /// propagation resumes.
    Continue { tail: Vec<u8> },
}

/// FIFO cache of script SHA1s the primary has already propagated as
/// `EVALSHA`, so a replica that already has the script body doesn't need
/// it resent on every invocation.
pub struct ScriptCache {
    order: VecDeque<String>,
    known: HashSet<String>,
    capacity: usize,
}

impl ScriptCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            known: HashSet::new(),
            capacity,
        }
    }

    pub fn contains(&self, sha1: &str) -> bool {
        self.known.contains(sha1)
    }

    /// Records `sha1` as known, evicting the oldest entry if the cache is
    /// full. Returns `true` if this was a new entry.
    pub fn insert(&mut self, sha1: &str) -> bool {
        if self.known.contains(sha1) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.known.remove(&oldest);
            }
        }
        self.order.push_back(sha1.to_string());
        self.known.insert(sha1.to_string());
        true
    }
}

pub struct PrimaryEngine {
    replid: String,
    /// The previous `replid`, kept live up to `second_replid_offset` so a
    /// replica that cached the old identity across a demotion/re-promotion
    /// can still partial-resync instead of paying for a full one.
    replid2: Option<String>,
    second_replid_offset: u64,
    backlog: Backlog,
    replicas: HashMap<ReplicaId, PrimaryReplica>,
    next_id: ReplicaId,
    pub stats: Stats,
    pub scripts: ScriptCache,
    output_capacity: usize,
}

impl PrimaryEngine {
    pub fn new(replid: String, backlog_capacity: usize, output_capacity: usize) -> Self {
        Self {
            replid,
            replid2: None,
            second_replid_offset: 0,
            backlog: Backlog::new(backlog_capacity),
            replicas: HashMap::new(),
            next_id: 0,
            stats: Stats::new(),
            scripts: ScriptCache::new(1024),
            output_capacity,
        }
    }

    pub fn replid(&self) -> &str {
        &self.replid
    }

    pub fn replid2(&self) -> Option<&str> {
        self.replid2.as_deref()
    }

    pub fn second_replid_offset(&self) -> u64 {
        self.second_replid_offset
    }

    pub fn master_repl_offset(&self) -> u64 {
        self.backlog.master_repl_offset()
    }

    /// Demotes the current `replid` to `replid2` (valid up to the current
    /// `master_repl_offset`) and adopts `new_replid` as the live identity.
    /// Called when a node that was replicating is promoted back to a
    /// primary, so a replica that cached the node's prior identity doesn't
    /// need a full resync just because the node changed roles.
    pub fn rotate_replid(&mut self, new_replid: String) {
        self.replid2 = Some(std::mem::replace(&mut self.replid, new_replid));
        self.second_replid_offset = self.backlog.master_repl_offset();
    }

    pub fn register_replica(&mut self) -> ReplicaId {
        let id = self.next_id;
        self.next_id += 1;
        self.replicas
            .insert(id, PrimaryReplica::new(self.output_capacity));
        id
    }

    pub fn remove_replica(&mut self, id: ReplicaId) {
        self.replicas.remove(&id);
    }

    pub fn replica(&self, id: ReplicaId) -> Option<&PrimaryReplica> {
        self.replicas.get(&id)
    }

    pub fn set_state(&mut self, id: ReplicaId, state: ReplicaState) -> Result<(), ReplError> {
        self.replicas
            .get_mut(&id)
            .map(|r| r.state = state)
            .ok_or(ReplError::UnknownReplica(id))
    }

    /// Decides full vs. partial resync for a `PSYNC <replid> <offset>`
    /// request. `requested_replid` of `"?"` always forces a full resync,
    /// matching a replica connecting for the first time. A `requested_replid`
    /// matching `replid2` is accepted the same as a match on the live
    /// `replid`, provided `requested_offset` is still within the window
    /// `replid2` was valid for.
    pub fn handle_psync(&mut self, requested_replid: &str, requested_offset: i64) -> PsyncDecision {
        let matches_replid2 = requested_offset >= 0
            && requested_offset as u64 <= self.second_replid_offset
            && self.replid2.as_deref() == Some(requested_replid);
        if (requested_replid != self.replid && !matches_replid2) || requested_offset < 0 {
            self.stats.record_full_resync();
            return PsyncDecision::FullResync {
                replid: self.replid.clone(),
                offset: self.backlog.master_repl_offset(),
            };
        }
        match self.backlog.read_from(requested_offset as u64) {
            Ok(tail) => {
                self.stats.record_partial_resync();
                PsyncDecision::Continue { tail }
            }
            Err(_) => {
                self.stats.record_partial_resync_denied();
                PsyncDecision::FullResync {
                    replid: self.replid.clone(),
                    offset: self.backlog.master_repl_offset(),
                }
            }
        }
    }

    /// Appends propagated bytes to the backlog and fans them out to every
    /// `Online` replica's output queue. A replica still mid-snapshot does
    /// not receive live bytes; it gets the backlog tail when it reaches
    /// `Online` instead.
    pub fn propagate(&mut self, bytes: &[u8]) {
        self.backlog.append(bytes);
        self.stats.record_propagated(bytes.len());
        for replica in self.replicas.values() {
            if replica.state == ReplicaState::Online {
                let _ = replica.output.push(bytes.to_vec());
            }
        }
    }

    pub fn ack(&mut self, id: ReplicaId, offset: u64, now_secs: u64) -> Result<(), ReplError> {
        let replica = self
            .replicas
            .get_mut(&id)
            .ok_or(ReplError::UnknownReplica(id))?;
        replica.ack_offset = offset;
        replica.last_ack_time = now_secs;
        if replica.state == ReplicaState::OnlinePendingAck {
            replica.state = ReplicaState::Online;
        }
        Ok(())
    }

    /// Number of `Online` replicas that have acknowledged at least
    /// `min_offset`, the quantity `WAIT numreplicas timeout` polls for.
    pub fn good_replica_count(&self, min_offset: u64) -> usize {
        self.replicas
            .values()
            .filter(|r| r.state == ReplicaState::Online && r.ack_offset >= min_offset)
            .count()
    }

    /// Inline bytes to broadcast to every `Online` replica to solicit a
    /// fresh `REPLCONF ACK`, coalesced into one encode per call rather than
    /// one per waiting client.
    pub fn getack_broadcast(&self) -> Vec<u8> {
        kiln_wire::inline::encode_inline(&["REPLCONF", "GETACK", "*"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PrimaryEngine {
        PrimaryEngine::new("myid123".to_string(), 1024, 64)
    }

    #[test]
    fn unknown_replid_forces_full_resync() {
        let mut e = engine();
        let decision = e.handle_psync("?", -1);
        assert!(matches!(decision, PsyncDecision::FullResync { .. }));
        assert_eq!(e.stats.full_resyncs(), 1);
    }

    #[test]
    fn matching_replid_within_window_continues() {
        let mut e = engine();
        e.propagate(b"hello");
        let decision = e.handle_psync("myid123", 0);
        assert_eq!(
            decision,
            PsyncDecision::Continue {
                tail: b"hello".to_vec()
            }
        );
        assert_eq!(e.stats.partial_resyncs(), 1);
    }

    #[test]
    fn matching_replid_with_stale_offset_falls_back_to_full_resync() {
        let mut e = PrimaryEngine::new("myid123".to_string(), 4, 64);
        e.propagate(b"abcdef");
        let decision = e.handle_psync("myid123", 0);
        assert!(matches!(decision, PsyncDecision::FullResync { .. }));
        assert_eq!(e.stats.partial_resync_denials(), 1);
    }

    #[test]
    fn only_online_replicas_receive_propagated_bytes() {
        let mut e = engine();
        let waiting = e.register_replica();
        let online = e.register_replica();
        e.set_state(online, ReplicaState::Online).unwrap();
        e.propagate(b"SET k v");

        assert!(e.replica(waiting).unwrap().output_handle().pop().is_none());
        assert_eq!(
            e.replica(online).unwrap().output_handle().pop().unwrap(),
            b"SET k v"
        );
    }

    #[test]
    fn online_pending_ack_does_not_receive_live_writes_until_acked() {
        let mut e = engine();
        let id = e.register_replica();
        e.set_state(id, ReplicaState::OnlinePendingAck).unwrap();
        e.propagate(b"SET k v");
        assert!(e.replica(id).unwrap().output_handle().pop().is_none());

        e.ack(id, 0, 1).unwrap();
        assert_eq!(e.replica(id).unwrap().state, ReplicaState::Online);
        e.propagate(b"SET k2 v2");
        assert_eq!(
            e.replica(id).unwrap().output_handle().pop().unwrap(),
            b"SET k2 v2"
        );
    }

    #[test]
    fn good_replica_count_respects_ack_offset_and_state() {
        let mut e = engine();
        let a = e.register_replica();
        let b = e.register_replica();
        e.set_state(a, ReplicaState::Online).unwrap();
        e.set_state(b, ReplicaState::Online).unwrap();
        e.ack(a, 100, 1).unwrap();
        e.ack(b, 50, 1).unwrap();
        assert_eq!(e.good_replica_count(100), 1);
        assert_eq!(e.good_replica_count(50), 2);
    }

    #[test]
    fn psync_against_rotated_out_replid_continues_within_its_old_window() {
        let mut e = engine();
        e.propagate(b"before rotation");
        let offset_at_rotation = e.master_repl_offset();
        e.rotate_replid("newid456".to_string());
        assert_eq!(e.replid(), "newid456");
        assert_eq!(e.replid2(), Some("myid123"));
        assert_eq!(e.second_replid_offset(), offset_at_rotation);

        e.propagate(b"after rotation");
        // A replica that cached the pre-rotation identity can still
        // continue, as long as its offset predates the rotation.
        let decision = e.handle_psync("myid123", 0);
        assert_eq!(
            decision,
            PsyncDecision::Continue {
                tail: b"before rotationafter rotation".to_vec()
            }
        );
    }

    #[test]
    fn psync_against_rotated_out_replid_past_its_window_forces_full_resync() {
        let mut e = engine();
        e.propagate(b"before rotation");
        let offset_at_rotation = e.master_repl_offset();
        e.rotate_replid("newid456".to_string());
        e.propagate(b"after rotation");

        // Requesting an offset past where `replid2` stopped being valid
        // isn't honored even though the backlog physically still has it.
        let decision = e.handle_psync("myid123", offset_at_rotation as i64 + 1);
        assert!(matches!(decision, PsyncDecision::FullResync { .. }));
    }

    #[test]
    fn generate_replid_is_40_lowercase_hex_chars() {
        let id = generate_replid();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn wait_barrier_counts_replicas_only_after_they_ack_the_getack_round() {
        let mut e = engine();
        let a = e.register_replica();
        let b = e.register_replica();
        e.set_state(a, ReplicaState::Online).unwrap();
        e.set_state(b, ReplicaState::Online).unwrap();
        e.propagate(b"SET k v");
        let target_offset = e.master_repl_offset();

        // Neither replica has acked the write yet.
        assert_eq!(e.good_replica_count(target_offset), 0);

        // WAIT solicits a round of ACKs; caller sends this to every replica.
        let getack = e.getack_broadcast();
        assert_eq!(getack, kiln_wire::inline::encode_inline(&["REPLCONF", "GETACK", "*"]));

        // Only `a` answers in time.
        e.ack(a, target_offset, 5).unwrap();
        assert_eq!(e.good_replica_count(target_offset), 1);

        // `b` answers late, now both satisfy the barrier.
        e.ack(b, target_offset, 6).unwrap();
        assert_eq!(e.good_replica_count(target_offset), 2);
    }

    #[test]
    fn script_cache_evicts_oldest_entry_once_full() {
        let mut cache = ScriptCache::new(2);
        assert!(cache.insert("a"));
        assert!(cache.insert("b"));
        assert!(cache.insert("c"));
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }
}
