//! # kiln-types: the value-object model
//!
//! A value is a tagged union over the seven logical types a key can hold
//! (`String`, `List`, `Set`, `Hash`, `SortedSet`, `Stream`, `Module`). Each
//! logical type has one or more *encodings* — compact in-memory shapes that
//! the value transitions through as it grows (see [`StringRepr`],
//! [`ListRepr`], [`SetRepr`], [`HashRepr`], [`SortedSetRepr`]).
//!
//! Lifetime is modeled with [`Object`], which replaces the `{refcount, type,
//! void*}` trick of a C implementation with three ownership modes:
//!
//! - [`Object::Owned`] — normal, uniquely-or-shared heap value. Backed by
//!   `Rc<Value>`; `Rc::strong_count` *is* the reference count.
//! - [`Object::Shared`] — an immortal value from [`SharedIntegers`]. Never
//!   mutated; `OBJECT REFCOUNT` reports a sentinel rather than the real
//!   `Rc` count, matching the source's "reads as immortal" contract.
//! - [`Object::Static`] — a `'static` sentinel. Mutating or manually
//!   decref'ing a `Static` object is a programming error and panics.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

mod skiplist;
mod stream;

pub use skiplist::SkipListSet;
pub use stream::{Consumer, ConsumerGroup, PendingEntry, StreamEntryId, StreamRepr};

/// Number of integers kept immortal in the shared pool: `[0, SHARED_INTEGERS)`.
pub const SHARED_INTEGERS: i64 = 10_000;

/// Length above which a string is no longer eligible for the `EMBSTR` encoding.
pub const EMBSTR_LIMIT: usize = 44;

/// Reported refcount for immortal objects (shared pool, static sentinels).
///
/// Mirrors the source's `OBJ_SHARED_REFCOUNT` convention: large enough that
/// nothing will ever observe it reaching zero.
pub const IMMORTAL_REFCOUNT: i64 = i32::MAX as i64;

/// Which index (0-based) a key lives in. The core does not interpret this
/// beyond using it to key into a keyspace table and to emit `SELECT` frames.
pub type DbIndex = u32;

/// The logical type of a value, independent of its current encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    String,
    List,
    Set,
    Hash,
    SortedSet,
    Stream,
    Module,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectType::String => "string",
            ObjectType::List => "list",
            ObjectType::Set => "set",
            ObjectType::Hash => "hash",
            ObjectType::SortedSet => "zset",
            ObjectType::Stream => "stream",
            ObjectType::Module => "module",
        };
        f.write_str(s)
    }
}

/// A value's current encoding. Distinct names across types are kept
/// (`IntSet` vs `Int`) so a caller never needs to disambiguate by type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Int,
    EmbStr,
    Raw,
    ZipList,
    QuickList,
    IntSet,
    Ht,
    SkipList,
    StreamEnc,
    ModuleEnc,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Encoding::Int => "int",
            Encoding::EmbStr => "embstr",
            Encoding::Raw => "raw",
            Encoding::ZipList => "ziplist",
            Encoding::QuickList => "quicklist",
            Encoding::IntSet => "intset",
            Encoding::Ht => "hashtable",
            Encoding::SkipList => "skiplist",
            Encoding::StreamEnc => "stream",
            Encoding::ModuleEnc => "module",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by value-object operations. Type mismatches are reported
/// here and translated by the command-dispatch layer above into its own
/// client-facing error text; this crate never formats a `-WRONGTYPE` string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("value is not of type {expected}, found {actual}")]
    TypeMismatch {
        expected: ObjectType,
        actual: ObjectType,
    },
    #[error("value is not an integer or out of range")]
    NotAnInteger,
    #[error("value is not a valid float")]
    NotADouble,
    #[error("element too large for this encoding")]
    ElementTooLarge,
}

pub type ValueResult<T> = Result<T, ValueError>;

// ===========================================================================
// String
// ===========================================================================

/// The owned representation of a `String` value.
///
/// The three variants double as the encoding tag: there is no separate
/// `encoding` field to fall out of sync with the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StringRepr {
    /// Parses as an `i64` and is stored inline — no heap allocation.
    Int(i64),
    /// Short byte string (`len <= EMBSTR_LIMIT`), immutable in place: any
    /// append promotes to `Raw` first (mirrors "embstr is copy-on-write").
    EmbStr(Box<[u8]>),
    /// Heap-allocated, growable byte string. May carry spare capacity.
    Raw(Vec<u8>),
}

impl StringRepr {
    pub fn encoding(&self) -> Encoding {
        match self {
            StringRepr::Int(_) => Encoding::Int,
            StringRepr::EmbStr(_) => Encoding::EmbStr,
            StringRepr::Raw(_) => Encoding::Raw,
        }
    }

    /// Picks the smallest legal encoding for `bytes`, per the "try-encode"
    /// contract: integer-parseable -> `Int`; short -> `EmbStr`; else `Raw`.
    pub fn try_encode(bytes: &[u8]) -> StringRepr {
        if let Some(i) = parse_strict_i64(bytes) {
            return StringRepr::Int(i);
        }
        if bytes.len() <= EMBSTR_LIMIT {
            StringRepr::EmbStr(bytes.into())
        } else {
            StringRepr::Raw(bytes.to_vec())
        }
    }

    pub fn as_bytes_owned(&self) -> Vec<u8> {
        match self {
            StringRepr::Int(i) => i.to_string().into_bytes(),
            StringRepr::EmbStr(b) => b.to_vec(),
            StringRepr::Raw(b) => b.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StringRepr::Int(i) => int_digit_len(*i),
            StringRepr::EmbStr(b) => b.len(),
            StringRepr::Raw(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_integer(&self) -> ValueResult<i64> {
        match self {
            StringRepr::Int(i) => Ok(*i),
            StringRepr::EmbStr(b) => parse_strict_i64(b).ok_or(ValueError::NotAnInteger),
            StringRepr::Raw(b) => parse_strict_i64(b).ok_or(ValueError::NotAnInteger),
        }
    }

    pub fn as_double(&self) -> ValueResult<f64> {
        let bytes = match self {
            StringRepr::Int(i) => return Ok(*i as f64),
            StringRepr::EmbStr(b) => b.as_ref(),
            StringRepr::Raw(b) => b.as_slice(),
        };
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .ok_or(ValueError::NotADouble)
    }

    /// Appends `data`, promoting to `Raw` first if necessary (an `EmbStr` or
    /// `Int` is never mutated in place).
    pub fn append(&mut self, data: &[u8]) {
        match self {
            StringRepr::Raw(v) => v.extend_from_slice(data),
            other => {
                let mut v = other.as_bytes_owned();
                v.extend_from_slice(data);
                *other = StringRepr::Raw(v);
            }
        }
    }

    /// Drops spare `Vec` capacity when it exceeds 10% slack, per the
    /// try-encode trim contract. No-op for `Int`/`EmbStr`.
    pub fn trim_excess(&mut self) {
        if let StringRepr::Raw(v) = self {
            let slack = v.capacity().saturating_sub(v.len());
            if v.capacity() > 0 && slack * 10 > v.capacity() {
                v.shrink_to_fit();
            }
        }
    }
}

fn int_digit_len(i: i64) -> usize {
    i.to_string().len()
}

/// Strict integer parse: no leading zeros (other than "0" itself), no
/// leading `+`, no surrounding whitespace. Matches the source's
/// `string2ll` contract so `"007"` never silently becomes `Int(7)`.
fn parse_strict_i64(bytes: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(bytes).ok()?;
    if s.is_empty() {
        return None;
    }
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    if neg && digits == "0" {
        return None; // "-0" is not canonical
    }
    s.parse::<i64>().ok()
}

// ===========================================================================
// List
// ===========================================================================

/// A single node of a `QuickList`: a run of entries, optionally LZF-compressed
/// while cold. Compression/decompression is an RDB-codec and storage-layer
/// concern; this crate only tracks the logical entries.
#[derive(Debug, Clone, PartialEq)]
pub struct QuickListNode {
    pub entries: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListRepr {
    /// Compact form for small lists: one packed run of entries.
    ZipList(Vec<Vec<u8>>),
    /// Doubly-linked run of packed nodes.
    QuickList(std::collections::VecDeque<QuickListNode>),
}

impl ListRepr {
    pub fn encoding(&self) -> Encoding {
        match self {
            ListRepr::ZipList(_) => Encoding::ZipList,
            ListRepr::QuickList(_) => Encoding::QuickList,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ListRepr::ZipList(v) => v.len(),
            ListRepr::QuickList(nodes) => nodes.iter().map(|n| n.entries.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates logical entries in order, independent of node structure.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Vec<u8>> + '_> {
        match self {
            ListRepr::ZipList(v) => Box::new(v.iter()),
            ListRepr::QuickList(nodes) => Box::new(nodes.iter().flat_map(|n| n.entries.iter())),
        }
    }

    pub fn push_back(&mut self, entry: Vec<u8>) {
        match self {
            ListRepr::ZipList(v) => v.push(entry),
            ListRepr::QuickList(nodes) => {
                if let Some(last) = nodes.back_mut() {
                    last.entries.push(entry);
                } else {
                    nodes.push_back(QuickListNode {
                        entries: vec![entry],
                    });
                }
            }
        }
    }

    /// One-way transition: packs the ziplist into a single quicklist node.
    /// No-op if already a `QuickList`.
    pub fn promote_to_quicklist(&mut self) {
        if let ListRepr::ZipList(v) = self {
            let entries = std::mem::take(v);
            let len = entries.len();
            let mut nodes = std::collections::VecDeque::new();
            nodes.push_back(QuickListNode { entries });
            *self = ListRepr::QuickList(nodes);
            tracing::trace!(len, "ziplist -> quicklist");
        }
    }
}

// ===========================================================================
// Set
// ===========================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SetRepr {
    /// Sorted ascending array of distinct integers.
    IntSet(Vec<i64>),
    Ht(std::collections::HashSet<Vec<u8>>),
}

impl SetRepr {
    pub fn encoding(&self) -> Encoding {
        match self {
            SetRepr::IntSet(_) => Encoding::IntSet,
            SetRepr::Ht(_) => Encoding::Ht,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SetRepr::IntSet(v) => v.len(),
            SetRepr::Ht(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, member: &[u8]) -> bool {
        match self {
            SetRepr::IntSet(v) => parse_strict_i64(member)
                .map(|i| v.binary_search(&i).is_ok())
                .unwrap_or(false),
            SetRepr::Ht(s) => s.contains(member),
        }
    }

    /// Inserts `member`, returning `true` if it was newly added. If `member`
    /// is not an integer and `self` is still `IntSet`, the caller must
    /// promote via [`SetRepr::promote_to_hashtable`] first.
    pub fn insert_int(&mut self, member: i64) -> bool {
        match self {
            SetRepr::IntSet(v) => match v.binary_search(&member) {
                Ok(_) => false,
                Err(idx) => {
                    v.insert(idx, member);
                    true
                }
            },
            SetRepr::Ht(s) => s.insert(member.to_string().into_bytes()),
        }
    }

    pub fn insert_bytes(&mut self, member: Vec<u8>) -> bool {
        match self {
            SetRepr::Ht(s) => s.insert(member),
            SetRepr::IntSet(_) => {
                unreachable!("caller must promote before inserting non-integer members")
            }
        }
    }

    pub fn promote_to_hashtable(&mut self) {
        if let SetRepr::IntSet(v) = self {
            let len = v.len();
            let members = std::mem::take(v)
                .into_iter()
                .map(|i| i.to_string().into_bytes())
                .collect();
            *self = SetRepr::Ht(members);
            tracing::trace!(len, "intset -> hashtable");
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = Vec<u8>> + '_> {
        match self {
            SetRepr::IntSet(v) => Box::new(v.iter().map(|i| i.to_string().into_bytes())),
            SetRepr::Ht(s) => Box::new(s.iter().cloned()),
        }
    }
}

// ===========================================================================
// Hash
// ===========================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum HashRepr {
    /// Insertion-ordered field/value pairs, scanned linearly.
    ZipList(Vec<(Vec<u8>, Vec<u8>)>),
    Ht(std::collections::HashMap<Vec<u8>, Vec<u8>>),
}

impl HashRepr {
    pub fn encoding(&self) -> Encoding {
        match self {
            HashRepr::ZipList(_) => Encoding::ZipList,
            HashRepr::Ht(_) => Encoding::Ht,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HashRepr::ZipList(v) => v.len(),
            HashRepr::Ht(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, field: &[u8]) -> Option<&[u8]> {
        match self {
            HashRepr::ZipList(v) => v
                .iter()
                .find(|(f, _)| f == field)
                .map(|(_, val)| val.as_slice()),
            HashRepr::Ht(m) => m.get(field).map(Vec::as_slice),
        }
    }

    /// Sets `field`, returning `true` if it was newly inserted (not updated).
    pub fn set(&mut self, field: Vec<u8>, value: Vec<u8>) -> bool {
        match self {
            HashRepr::ZipList(v) => {
                if let Some(entry) = v.iter_mut().find(|(f, _)| *f == field) {
                    entry.1 = value;
                    false
                } else {
                    v.push((field, value));
                    true
                }
            }
            HashRepr::Ht(m) => m.insert(field, value).is_none(),
        }
    }

    pub fn promote_to_hashtable(&mut self) {
        if let HashRepr::ZipList(v) = self {
            let len = v.len();
            *self = HashRepr::Ht(std::mem::take(v).into_iter().collect());
            tracing::trace!(len, "ziplist -> hashtable");
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = (&[u8], &[u8])> + '_> {
        match self {
            HashRepr::ZipList(v) => Box::new(v.iter().map(|(f, val)| (f.as_slice(), val.as_slice()))),
            HashRepr::Ht(m) => Box::new(m.iter().map(|(f, val)| (f.as_slice(), val.as_slice()))),
        }
    }
}

// ===========================================================================
// Sorted Set
// ===========================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SortedSetRepr {
    /// Score-ordered `(member, score)` pairs, scanned linearly.
    ZipList(Vec<(Vec<u8>, f64)>),
    /// Hash table keyed by member, paired with an ordered index by score.
    /// `unsafe_code` is denied workspace-wide, so the "skip list" from the
    /// source is realized as a `BTreeMap`-backed ordered index
    /// ([`SkipListSet`]) rather than a hand-rolled pointer-chasing list —
    /// same O(log n) ordered operations, no raw pointers.
    SkipList(SkipListSet),
}

impl SortedSetRepr {
    pub fn encoding(&self) -> Encoding {
        match self {
            SortedSetRepr::ZipList(_) => Encoding::ZipList,
            SortedSetRepr::SkipList(_) => Encoding::SkipList,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SortedSetRepr::ZipList(v) => v.len(),
            SortedSetRepr::SkipList(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        match self {
            SortedSetRepr::ZipList(v) => v.iter().find(|(m, _)| m == member).map(|(_, s)| *s),
            SortedSetRepr::SkipList(s) => s.score(member),
        }
    }

    /// Inserts or updates `member`'s score, returning `true` if newly added.
    pub fn insert(&mut self, member: Vec<u8>, score: f64) -> bool {
        match self {
            SortedSetRepr::ZipList(v) => {
                if let Some(entry) = v.iter_mut().find(|(m, _)| *m == member) {
                    entry.1 = score;
                    false
                } else {
                    let pos = v.partition_point(|(_, s)| *s < score);
                    v.insert(pos, (member, score));
                    true
                }
            }
            SortedSetRepr::SkipList(s) => s.insert(member, score),
        }
    }

    pub fn promote_to_skiplist(&mut self) {
        if let SortedSetRepr::ZipList(v) = self {
            let len = v.len();
            let mut s = SkipListSet::new();
            for (member, score) in std::mem::take(v) {
                s.insert(member, score);
            }
            *self = SortedSetRepr::SkipList(s);
            tracing::trace!(len, "ziplist -> skiplist");
        }
    }

    /// Iterates `(member, score)` in ascending score order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = (&[u8], f64)> + '_> {
        match self {
            SortedSetRepr::ZipList(v) => Box::new(v.iter().map(|(m, s)| (m.as_slice(), *s))),
            SortedSetRepr::SkipList(s) => s.iter(),
        }
    }
}

// ===========================================================================
// Module (opaque; out of scope beyond carrying the tag)
// ===========================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRepr {
    pub type_name: String,
    pub payload: Vec<u8>,
}

// ===========================================================================
// Value / encoding-transition policy
// ===========================================================================

/// Per-type upgrade thresholds. The first insertion that would exceed one of
/// these triggers a one-way transition to the larger encoding.
#[derive(Debug, Clone, Copy)]
pub struct EncodingLimits {
    pub list_max_entries: usize,
    pub list_max_entry_bytes: usize,
    pub set_max_intset_entries: usize,
    pub hash_max_entries: usize,
    pub hash_max_entry_bytes: usize,
    pub zset_max_entries: usize,
    pub zset_max_entry_bytes: usize,
}

impl Default for EncodingLimits {
    fn default() -> Self {
        Self {
            list_max_entries: 128,
            list_max_entry_bytes: 64,
            set_max_intset_entries: 512,
            hash_max_entries: 128,
            hash_max_entry_bytes: 64,
            zset_max_entries: 128,
            zset_max_entry_bytes: 64,
        }
    }
}

/// A value's owned representation, tagged by logical type. The enum
/// discriminant doubles as [`ObjectType`]; there is no separate field that
/// could drift out of sync with the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRepr {
    Str(StringRepr),
    List(ListRepr),
    Set(SetRepr),
    Hash(HashRepr),
    SortedSet(SortedSetRepr),
    Stream(StreamRepr),
    Module(ModuleRepr),
}

impl ValueRepr {
    pub fn object_type(&self) -> ObjectType {
        match self {
            ValueRepr::Str(_) => ObjectType::String,
            ValueRepr::List(_) => ObjectType::List,
            ValueRepr::Set(_) => ObjectType::Set,
            ValueRepr::Hash(_) => ObjectType::Hash,
            ValueRepr::SortedSet(_) => ObjectType::SortedSet,
            ValueRepr::Stream(_) => ObjectType::Stream,
            ValueRepr::Module(_) => ObjectType::Module,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match self {
            ValueRepr::Str(r) => r.encoding(),
            ValueRepr::List(r) => r.encoding(),
            ValueRepr::Set(r) => r.encoding(),
            ValueRepr::Hash(r) => r.encoding(),
            ValueRepr::SortedSet(r) => r.encoding(),
            ValueRepr::Stream(_) => Encoding::StreamEnc,
            ValueRepr::Module(_) => Encoding::ModuleEnc,
        }
    }

    pub fn as_string(&self) -> ValueResult<&StringRepr> {
        match self {
            ValueRepr::Str(r) => Ok(r),
            other => Err(ValueError::TypeMismatch {
                expected: ObjectType::String,
                actual: other.object_type(),
            }),
        }
    }

    pub fn as_list(&self) -> ValueResult<&ListRepr> {
        match self {
            ValueRepr::List(r) => Ok(r),
            other => Err(ValueError::TypeMismatch {
                expected: ObjectType::List,
                actual: other.object_type(),
            }),
        }
    }

    pub fn as_set(&self) -> ValueResult<&SetRepr> {
        match self {
            ValueRepr::Set(r) => Ok(r),
            other => Err(ValueError::TypeMismatch {
                expected: ObjectType::Set,
                actual: other.object_type(),
            }),
        }
    }

    pub fn as_hash(&self) -> ValueResult<&HashRepr> {
        match self {
            ValueRepr::Hash(r) => Ok(r),
            other => Err(ValueError::TypeMismatch {
                expected: ObjectType::Hash,
                actual: other.object_type(),
            }),
        }
    }

    pub fn as_sorted_set(&self) -> ValueResult<&SortedSetRepr> {
        match self {
            ValueRepr::SortedSet(r) => Ok(r),
            other => Err(ValueError::TypeMismatch {
                expected: ObjectType::SortedSet,
                actual: other.object_type(),
            }),
        }
    }

    /// Applies the upgrade-threshold policy after a mutation, one way only.
    pub fn try_upgrade_encoding(&mut self, limits: &EncodingLimits) {
        match self {
            ValueRepr::List(r) => {
                if r.len() > limits.list_max_entries
                    || r.iter().any(|e| e.len() > limits.list_max_entry_bytes)
                {
                    r.promote_to_quicklist();
                }
            }
            ValueRepr::Set(SetRepr::IntSet(v)) if v.len() > limits.set_max_intset_entries => {
                if let ValueRepr::Set(s) = self {
                    s.promote_to_hashtable();
                }
            }
            ValueRepr::Hash(r) => {
                if r.len() > limits.hash_max_entries
                    || r.iter().any(|(f, v)| {
                        f.len() > limits.hash_max_entry_bytes || v.len() > limits.hash_max_entry_bytes
                    })
                {
                    r.promote_to_hashtable();
                }
            }
            ValueRepr::SortedSet(r) => {
                if r.len() > limits.zset_max_entries
                    || r.iter().any(|(m, _)| m.len() > limits.zset_max_entry_bytes)
                {
                    r.promote_to_skiplist();
                }
            }
            _ => {}
        }
    }
}

/// A value plus the bookkeeping every object carries: a single last-access
/// timestamp (seconds since an epoch chosen by the caller) used by eviction
/// policies. `last_access` is a `Cell` so reading a value (which bumps it)
/// does not require `&mut` access through a shared `Rc`.
#[derive(Debug)]
pub struct Value {
    pub repr: ValueRepr,
    last_access: Cell<u32>,
}

impl Value {
    pub fn new(repr: ValueRepr, now_secs: u32) -> Self {
        Self {
            repr,
            last_access: Cell::new(now_secs),
        }
    }

    pub fn last_access(&self) -> u32 {
        self.last_access.get()
    }

    pub fn touch(&self, now_secs: u32) {
        self.last_access.set(now_secs);
    }

    pub fn idle_secs(&self, now_secs: u32) -> u32 {
        now_secs.saturating_sub(self.last_access.get())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.repr == other.repr
    }
}

/// The three ownership modes a key's value can hold.
///
/// Cloning an `Object` is the `incref` operation: for `Owned`/`Shared` it is
/// an `Rc::clone` (cheap pointer copy + count bump); for `Static` it is a
/// reference copy. There is deliberately no `decref` method — dropping the
/// `Object` *is* decref, and `Rc`'s own drop glue releases the owned
/// representation at zero, exactly as spec'd.
#[derive(Debug, Clone)]
pub enum Object {
    Owned(Rc<Value>),
    Shared(Rc<Value>),
    Static(&'static Value),
}

impl Object {
    pub fn owned(repr: ValueRepr, now_secs: u32) -> Self {
        Object::Owned(Rc::new(Value::new(repr, now_secs)))
    }

    pub fn value(&self) -> &Value {
        match self {
            Object::Owned(rc) | Object::Shared(rc) => rc,
            Object::Static(v) => v,
        }
    }

    pub fn object_type(&self) -> ObjectType {
        self.value().repr.object_type()
    }

    pub fn encoding(&self) -> Encoding {
        self.value().repr.encoding()
    }

    /// `OBJECT REFCOUNT`. Immortal objects (`Shared`/`Static`) report the
    /// sentinel; ordinary objects report the real `Rc` strong count.
    pub fn refcount(&self) -> i64 {
        match self {
            Object::Owned(rc) => Rc::strong_count(rc) as i64,
            Object::Shared(_) | Object::Static(_) => IMMORTAL_REFCOUNT,
        }
    }

    /// Deep-copies the value into a freshly owned object (the `duplicate`
    /// operation), independent of the source's sharing mode. Used before any
    /// in-place mutation of a value that might be `Shared`.
    pub fn duplicate(&self, now_secs: u32) -> Object {
        Object::owned(self.value().repr.clone(), now_secs)
    }

    /// True if this object must never be mutated in place (copy-on-write is
    /// mandatory before any write through it).
    pub fn is_copy_on_write(&self) -> bool {
        matches!(self, Object::Shared(_) | Object::Static(_))
    }

    /// Mutable access to an owned value's representation.
    ///
    /// # Panics
    ///
    /// Panics if called on a `Shared` or `Static` object — mutating an
    /// immortal object is a programming error the caller must prevent by
    /// calling [`Object::duplicate`] first (copy-on-write).
    pub fn repr_mut(&mut self) -> &mut ValueRepr {
        match self {
            Object::Owned(rc) => {
                &mut Rc::get_mut(rc)
                    .expect("owned value has other live references; duplicate first")
                    .repr
            }
            Object::Shared(_) => panic!("attempted to mutate a SHARED object in place"),
            Object::Static(_) => panic!("attempted to mutate a STATIC object in place"),
        }
    }
}

// ===========================================================================
// Shared small-integer pool
// ===========================================================================

/// Eviction policies that need per-key access statistics. When the
/// configured policy is one of these, the shared integer pool is bypassed
/// (`spec.md` §4.1, "Shared pool policy") because every key must own its
/// own `last_access`/frequency counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    NoEviction,
    AllKeysLru,
    AllKeysLfu,
    VolatileLru,
    VolatileLfu,
    VolatileTtl,
    AllKeysRandom,
    VolatileRandom,
}

impl EvictionPolicy {
    /// Whether this policy needs per-key access statistics, disqualifying
    /// the shared integer pool for new values under this policy.
    pub fn needs_access_stats(self) -> bool {
        matches!(
            self,
            EvictionPolicy::AllKeysLru
                | EvictionPolicy::AllKeysLfu
                | EvictionPolicy::VolatileLru
                | EvictionPolicy::VolatileLfu
        )
    }
}

/// `[0, SHARED_INTEGERS)` worth of immortal `Object::Shared` string values,
/// built once at startup. Never mutated, never incref'd/decref'd in the
/// normal sense — see [`Object::refcount`].
pub struct SharedIntegers {
    pool: Vec<Rc<Value>>,
}

impl SharedIntegers {
    pub fn new() -> Self {
        let pool = (0..SHARED_INTEGERS)
            .map(|i| Rc::new(Value::new(ValueRepr::Str(StringRepr::Int(i)), 0)))
            .collect();
        Self { pool }
    }

    /// Returns the shared object for `n` if it is in range, else `None`.
    pub fn get(&self, n: i64) -> Option<Object> {
        if (0..SHARED_INTEGERS).contains(&n) {
            Some(Object::Shared(Rc::clone(&self.pool[n as usize])))
        } else {
            None
        }
    }

    /// Creates a string object for `n`: pulled from the pool when `policy`
    /// allows it and `n` is in range, else a freshly owned `Int`.
    pub fn create_string_from_int(&self, n: i64, policy: EvictionPolicy, now_secs: u32) -> Object {
        if !policy.needs_access_stats() {
            if let Some(shared) = self.get(n) {
                return shared;
            }
        }
        Object::owned(ValueRepr::Str(StringRepr::Int(n)), now_secs)
    }
}

impl Default for SharedIntegers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_try_encode_picks_int() {
        assert_eq!(StringRepr::try_encode(b"12345").encoding(), Encoding::Int);
        assert_eq!(StringRepr::try_encode(b"-7").encoding(), Encoding::Int);
    }

    #[test]
    fn string_try_encode_rejects_non_canonical_ints() {
        assert_eq!(StringRepr::try_encode(b"007").encoding(), Encoding::EmbStr);
        assert_eq!(StringRepr::try_encode(b"+5").encoding(), Encoding::EmbStr);
        assert_eq!(StringRepr::try_encode(b"-0").encoding(), Encoding::EmbStr);
    }

    #[test]
    fn string_try_encode_embstr_vs_raw() {
        let short = vec![b'a'; EMBSTR_LIMIT];
        assert_eq!(StringRepr::try_encode(&short).encoding(), Encoding::EmbStr);
        let long = vec![b'a'; EMBSTR_LIMIT + 1];
        assert_eq!(StringRepr::try_encode(&long).encoding(), Encoding::Raw);
    }

    #[test]
    fn append_promotes_embstr_to_raw() {
        let mut s = StringRepr::try_encode(b"hi");
        assert_eq!(s.encoding(), Encoding::EmbStr);
        s.append(b" there");
        assert_eq!(s.encoding(), Encoding::Raw);
        assert_eq!(s.as_bytes_owned(), b"hi there");
    }

    #[test]
    fn shared_pool_identity_under_noeviction() {
        let pool = SharedIntegers::new();
        let a = pool.create_string_from_int(5, EvictionPolicy::NoEviction, 0);
        let b = pool.create_string_from_int(5, EvictionPolicy::NoEviction, 0);
        match (&a, &b) {
            (Object::Shared(ra), Object::Shared(rb)) => assert!(Rc::ptr_eq(ra, rb)),
            _ => panic!("expected both to be Shared"),
        }
        assert_eq!(a.refcount(), IMMORTAL_REFCOUNT);
    }

    #[test]
    fn shared_pool_bypassed_under_lru() {
        let pool = SharedIntegers::new();
        let a = pool.create_string_from_int(5, EvictionPolicy::AllKeysLru, 0);
        let b = pool.create_string_from_int(5, EvictionPolicy::AllKeysLru, 0);
        assert!(matches!(a, Object::Owned(_)));
        assert!(matches!(b, Object::Owned(_)));
        assert_eq!(a.refcount(), 1);
    }

    #[test]
    fn shared_pool_out_of_range_falls_back_to_owned() {
        let pool = SharedIntegers::new();
        let a = pool.create_string_from_int(SHARED_INTEGERS + 1, EvictionPolicy::NoEviction, 0);
        assert!(matches!(a, Object::Owned(_)));
    }

    #[test]
    fn intset_to_hashtable_preserves_members() {
        let mut repr = ValueRepr::Set(SetRepr::IntSet(vec![]));
        for n in [1_i64, 2, 3] {
            if let ValueRepr::Set(s) = &mut repr {
                s.insert_int(n);
            }
        }
        assert_eq!(repr.encoding(), Encoding::IntSet);
        if let ValueRepr::Set(s) = &mut repr {
            s.promote_to_hashtable();
            s.insert_bytes(b"foo".to_vec());
        }
        assert_eq!(repr.encoding(), Encoding::Ht);
        let members: std::collections::HashSet<_> = repr.as_set().unwrap().iter().collect();
        let expected: std::collections::HashSet<_> =
            [b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"foo".to_vec()]
                .into_iter()
                .collect();
        assert_eq!(members, expected);
    }

    #[test]
    #[should_panic(expected = "SHARED")]
    fn mutating_shared_object_panics() {
        let pool = SharedIntegers::new();
        let mut obj = pool.get(5).unwrap();
        obj.repr_mut();
    }

    #[test]
    fn duplicate_yields_independent_owned_copy() {
        let pool = SharedIntegers::new();
        let shared = pool.get(5).unwrap();
        let mut owned = shared.duplicate(0);
        owned.repr_mut(); // must not panic
        assert_eq!(owned.object_type(), ObjectType::String);
        assert!(matches!(owned, Object::Owned(_)));
    }
}
