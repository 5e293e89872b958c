//! Top-level daemon error type. Internal crates surface their own
//! `thiserror` enums at their public boundary; this one exists only to
//! collect those into a single type for `main`'s `anyhow` chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KilnError {
    #[error(transparent)]
    Config(#[from] kiln_config::ConfigError),

    #[error(transparent)]
    Server(#[from] kiln_server::ServerError),

    #[error(transparent)]
    Replication(#[from] kiln_repl::ReplError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] kiln_storage::rdb::RdbError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
