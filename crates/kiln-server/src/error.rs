//! Server error types.

use kiln_storage::StorageError;
use kiln_wire::WireError;
use thiserror::Error;

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("maximum connections reached: {0}")]
    MaxConnectionsReached(usize),

    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("server shutdown")]
    Shutdown,

    #[error("replication error: {0}")]
    Replication(String),
}
