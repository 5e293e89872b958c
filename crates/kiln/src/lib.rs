//! Kiln: an in-memory key/value store with Redis-style primary/replica
//! replication. This crate is the thin daemon layer — `kiln-config` loads
//! settings, `kiln-storage` holds the keyspace, `kiln-repl` runs the
//! replication engines, and `kiln-server` drives the client-facing event
//! loop. Nothing here implements new logic; it wires those crates
//! together into the two shapes the daemon can run as.

pub mod daemon;
pub mod error;

pub use daemon::{build_keyspace, build_primary_server, run_replica};
pub use error::KilnError;
