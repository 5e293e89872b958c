//! The keyspace: per-database key/value storage, expiration, and the
//! write-notification fan-out consumed by the replication feeder.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use kiln_types::{DbIndex, EvictionPolicy, Object, SharedIntegers};
use rand::Rng;

/// A single write or expiration, as seen by subscribers (replication
/// feeder, notification layer, blocked-client wakeup list). The keyspace
/// itself interprets none of these — it only reports what happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceEvent {
    pub db: DbIndex,
    pub op: &'static str,
    pub key: Vec<u8>,
}

/// Bounded fan-out queue for [`KeyspaceEvent`]s, matching the bounded-queue
/// backpressure convention used elsewhere for replica output buffers: a
/// slow/absent subscriber drops events rather than stalling writers.
pub struct EventBus {
    queue: Arc<ArrayQueue<KeyspaceEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity)),
        }
    }

    pub fn publish(&self, event: KeyspaceEvent) {
        // Best-effort: a full queue means a subscriber is behind, and the
        // write path must never block on it.
        let _ = self.queue.push(event);
    }

    pub fn try_recv(&self) -> Option<KeyspaceEvent> {
        self.queue.pop()
    }

    pub fn handle(&self) -> Arc<ArrayQueue<KeyspaceEvent>> {
        Arc::clone(&self.queue)
    }
}

struct Db {
    /// Insertion order is preserved by never reusing a slot in-place:
    /// deletions tombstone the slot and `entries` periodically compacts,
    /// so a `keys()` iterator snapshot taken mid-walk is never invalidated
    /// by a write that happens after the snapshot was taken.
    slots: Vec<Option<(Vec<u8>, Object)>>,
    index: HashMap<Vec<u8>, usize>,
    expires: HashMap<Vec<u8>, u64>,
    tombstones: usize,
}

impl Db {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            expires: HashMap::new(),
            tombstones: 0,
        }
    }

    fn raw_get(&self, key: &[u8]) -> Option<&Object> {
        let idx = *self.index.get(key)?;
        self.slots[idx].as_ref().map(|(_, obj)| obj)
    }

    fn raw_put(&mut self, key: Vec<u8>, value: Object) {
        if let Some(&idx) = self.index.get(key.as_slice()) {
            self.slots[idx] = Some((key, value));
            return;
        }
        let idx = self.slots.len();
        self.index.insert(key.clone(), idx);
        self.slots.push(Some((key, value)));
    }

    fn raw_remove(&mut self, key: &[u8]) -> Option<Object> {
        let idx = self.index.remove(key)?;
        self.expires.remove(key);
        let (_, obj) = self.slots[idx].take()?;
        self.tombstones += 1;
        if self.tombstones > self.slots.len() / 2 && self.slots.len() > 64 {
            self.compact();
        }
        Some(obj)
    }

    fn compact(&mut self) {
        let mut new_slots = Vec::with_capacity(self.slots.len() - self.tombstones);
        for slot in self.slots.drain(..).flatten() {
            self.index.insert(slot.0.clone(), new_slots.len());
            new_slots.push(Some(slot));
        }
        self.slots = new_slots;
        self.tombstones = 0;
    }

    fn keys_snapshot(&self) -> Vec<Vec<u8>> {
        self.slots
            .iter()
            .flatten()
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// All logical databases (`SELECT 0`..`SELECT N-1`), the expiration
/// machinery, and the write-event bus. Single-threaded by contract (§5):
/// the type holds no internal locking.
pub struct Keyspace {
    dbs: Vec<Db>,
    events: EventBus,
    eviction_policy: EvictionPolicy,
    shared_integers: SharedIntegers,
}

impl Keyspace {
    pub fn new(db_count: usize, eviction_policy: EvictionPolicy) -> Self {
        Self {
            dbs: (0..db_count).map(|_| Db::new()).collect(),
            events: EventBus::new(4096),
            eviction_policy,
            shared_integers: SharedIntegers::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction_policy
    }

    pub fn set_eviction_policy(&mut self, policy: EvictionPolicy) {
        self.eviction_policy = policy;
    }

    pub fn shared_integers(&self) -> &SharedIntegers {
        &self.shared_integers
    }

    pub fn db_count(&self) -> usize {
        self.dbs.len()
    }

    fn db(&self, index: DbIndex) -> &Db {
        &self.dbs[index as usize]
    }

    fn db_mut(&mut self, index: DbIndex) -> &mut Db {
        &mut self.dbs[index as usize]
    }

    /// Checks `key`'s TTL against `now_secs` and, if past, deletes it and
    /// emits an `expired` event. Must run before every read, per §4.2.
    fn expire_if_due(&mut self, db: DbIndex, key: &[u8], now_secs: u64) -> bool {
        let due = self
            .db(db)
            .expires
            .get(key)
            .is_some_and(|&at| at <= now_secs);
        if due {
            self.db_mut(db).raw_remove(key);
            self.events.publish(KeyspaceEvent {
                db,
                op: "expired",
                key: key.to_vec(),
            });
        }
        due
    }

    pub fn get(&mut self, db: DbIndex, key: &[u8], now_secs: u64) -> Option<&Object> {
        self.expire_if_due(db, key, now_secs);
        self.db(db).raw_get(key)
    }

    /// Reads a key without evaluating its TTL or requiring `&mut self`.
    /// Used by the RDB codec, which walks a `keys()` snapshot under a
    /// shared borrow and lets expiration run on the next `get`.
    pub fn peek(&self, db: DbIndex, key: &[u8]) -> Option<&Object> {
        self.db(db).raw_get(key)
    }

    pub fn exists(&mut self, db: DbIndex, key: &[u8], now_secs: u64) -> bool {
        self.get(db, key, now_secs).is_some()
    }

    pub fn put(&mut self, db: DbIndex, key: Vec<u8>, value: Object) {
        self.db_mut(db).raw_put(key.clone(), value);
        self.events.publish(KeyspaceEvent {
            db,
            op: "set",
            key,
        });
    }

    pub fn delete(&mut self, db: DbIndex, key: &[u8]) -> bool {
        let removed = self.db_mut(db).raw_remove(key).is_some();
        if removed {
            self.events.publish(KeyspaceEvent {
                db,
                op: "del",
                key: key.to_vec(),
            });
        }
        removed
    }

    pub fn set_expire(&mut self, db: DbIndex, key: &[u8], at_secs: u64) -> bool {
        if self.db(db).raw_get(key).is_none() {
            return false;
        }
        self.db_mut(db).expires.insert(key.to_vec(), at_secs);
        self.events.publish(KeyspaceEvent {
            db,
            op: "expire",
            key: key.to_vec(),
        });
        true
    }

    pub fn persist(&mut self, db: DbIndex, key: &[u8]) -> bool {
        self.db_mut(db).expires.remove(key).is_some()
    }

    pub fn get_expire(&self, db: DbIndex, key: &[u8]) -> Option<u64> {
        self.db(db).expires.get(key).copied()
    }

    pub fn random_key(&self, db: DbIndex) -> Option<Vec<u8>> {
        let live: Vec<&(Vec<u8>, Object)> = self.db(db).slots.iter().flatten().collect();
        if live.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..live.len());
        Some(live[idx].0.clone())
    }

    pub fn len(&self, db: DbIndex) -> usize {
        self.db(db).index.len()
    }

    pub fn is_empty(&self, db: DbIndex) -> bool {
        self.len(db) == 0
    }

    pub fn expires_len(&self, db: DbIndex) -> usize {
        self.db(db).expires.len()
    }

    /// Snapshot of live keys in insertion order, safe to iterate while the
    /// keyspace itself is mutated afterward (the caller holds its own
    /// copy, not a live view).
    pub fn keys(&self, db: DbIndex) -> Vec<Vec<u8>> {
        self.db(db).keys_snapshot()
    }

    /// Samples up to `sample_size` keys with a TTL in `db` and reaps any
    /// that are due, returning the count reaped. A cron task calls this on
    /// a timer to amortize expiration cleanup for keys nobody has read
    /// recently (the active-expire cycle spec.md §4.2 alludes to).
    pub fn active_expire_cycle(&mut self, db: DbIndex, sample_size: usize, now_secs: u64) -> usize {
        let candidates: Vec<Vec<u8>> = self
            .db(db)
            .expires
            .keys()
            .take(sample_size)
            .cloned()
            .collect();
        let mut reaped = 0;
        for key in candidates {
            if self.expire_if_due(db, &key, now_secs) {
                reaped += 1;
            }
        }
        reaped
    }

    /// Drains every database. Used before loading an RDB snapshot that
    /// replaces the in-memory dataset, and when a replica empties its
    /// dataset ahead of a diskless full resync.
    pub fn flush_all(&mut self) {
        for db in &mut self.dbs {
            *db = Db::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::{StringRepr, ValueRepr};

    fn obj(s: &str) -> Object {
        Object::owned(ValueRepr::Str(StringRepr::try_encode(s.as_bytes())), 0)
    }

    #[test]
    fn get_after_expiry_returns_none_and_deletes() {
        let mut ks = Keyspace::new(1, EvictionPolicy::NoEviction);
        ks.put(0, b"k".to_vec(), obj("v"));
        ks.set_expire(0, b"k", 100);
        assert!(ks.get(0, b"k", 50).is_some());
        assert!(ks.get(0, b"k", 150).is_none());
        assert_eq!(ks.len(0), 0);
    }

    #[test]
    fn active_expire_cycle_reaps_due_keys() {
        let mut ks = Keyspace::new(1, EvictionPolicy::NoEviction);
        ks.put(0, b"a".to_vec(), obj("1"));
        ks.put(0, b"b".to_vec(), obj("2"));
        ks.set_expire(0, b"a", 10);
        ks.set_expire(0, b"b", 10);
        let reaped = ks.active_expire_cycle(0, 10, 100);
        assert_eq!(reaped, 2);
        assert_eq!(ks.len(0), 0);
    }

    #[test]
    fn events_are_published_on_write_and_delete() {
        let mut ks = Keyspace::new(1, EvictionPolicy::NoEviction);
        ks.put(0, b"k".to_vec(), obj("v"));
        ks.delete(0, b"k");
        let first = ks.events().try_recv().unwrap();
        assert_eq!(first.op, "set");
        let second = ks.events().try_recv().unwrap();
        assert_eq!(second.op, "del");
    }

    #[test]
    fn keys_snapshot_survives_later_mutation() {
        let mut ks = Keyspace::new(1, EvictionPolicy::NoEviction);
        ks.put(0, b"a".to_vec(), obj("1"));
        ks.put(0, b"b".to_vec(), obj("2"));
        let snapshot = ks.keys(0);
        ks.delete(0, b"a");
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn set_expire_on_missing_key_fails() {
        let mut ks = Keyspace::new(1, EvictionPolicy::NoEviction);
        assert!(!ks.set_expire(0, b"missing", 100));
    }
}
