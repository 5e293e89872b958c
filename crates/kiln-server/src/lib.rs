//! `kiln-server`: the TCP daemon that exposes a [`kiln_storage::Keyspace`]
//! over the RESP wire protocol.
//!
//! The event loop uses `mio` for non-blocking I/O with a poll-based design —
//! no async runtime, explicit control flow, following the rest of this
//! workspace's style. A single poll loop owns every connection and the
//! cron tick (active-expire sampling, idle reaping); propagated writes are
//! handed straight to the primary replication engine from the same thread,
//! so there is never a write visible to a client before it is durable in
//! the backlog.

pub mod buffer_pool;
mod connection;
mod dispatch;
mod error;
mod server;

pub use buffer_pool::BytesMutPool;
pub use connection::Connection;
pub use dispatch::Dispatcher;
pub use error::{ServerError, ServerResult};
pub use server::{Server, ServerConfig, ShutdownHandle};
