//! Primary/replica replication: the backlog that makes partial resync
//! possible, the primary engine that decides resync strategy and fans out
//! writes, and the replica engine that walks the handshake and receives a
//! snapshot either on disk or diskless.

pub mod backlog;
pub mod error;
pub mod primary;
pub mod replica;
pub mod stats;

pub use backlog::Backlog;
pub use error::ReplError;
pub use primary::{generate_replid, PrimaryEngine, PsyncDecision, ReplicaId, ReplicaState};
pub use replica::{CachedMaster, DiskReceiver, DisklessReceiver, ReplicaLink, ReplicaLinkState};
pub use stats::Stats;
