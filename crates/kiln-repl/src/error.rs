use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplError {
    #[error("requested offset {requested} is outside the backlog window [{first}, {last}]")]
    OffsetOutOfRange {
        requested: u64,
        first: u64,
        last: u64,
    },
    #[error("replication id mismatch: backlog serves {ours}, replica asked for {theirs}")]
    ReplIdMismatch { ours: String, theirs: String },
    #[error("handshake failed at step {step}: {reason}")]
    HandshakeFailed { step: &'static str, reason: String },
    #[error("unknown replica {0}")]
    UnknownReplica(u64),
    #[error(transparent)]
    Wire(#[from] kiln_wire::WireError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
