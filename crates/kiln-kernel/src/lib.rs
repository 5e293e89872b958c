//! Encodes an applied write into the bytes that make it visible outside the
//! process over the replication stream. The core here stays pure — it never
//! opens a socket, writes a file, or mutates the keyspace itself;
//! `kiln-server`'s `Dispatcher` calls in with the command it just applied
//! and gets back the wire bytes to propagate.

pub mod command;
pub mod propagation;

pub use command::Command;
pub use propagation::Propagator;
