//! RESP multi-bulk framing and inline-command parsing: the single place
//! both the client/replica wire format and the replication handshake's
//! line-oriented commands live, so `kiln-server` and `kiln-repl` share one
//! implementation of each.

pub mod error;
pub mod inline;
pub mod resp;

pub use error::WireError;
pub use resp::Frame;
