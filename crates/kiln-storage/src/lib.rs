//! Keyspace storage and the RDB snapshot codec.
//!
//! `keyspace` holds the live dataset (per-database key/value storage,
//! expiration, write-event fan-out); `rdb` serializes and deserializes a
//! point-in-time snapshot of it; `codec`/`lzf` provide the compression the
//! RDB format uses for its string and packed-list payloads.

pub mod codec;
pub mod error;
pub mod keyspace;
pub mod lzf;
pub mod rdb;

pub use error::StorageError;
pub use keyspace::{EventBus, Keyspace, KeyspaceEvent};
pub use rdb::RdbError;
