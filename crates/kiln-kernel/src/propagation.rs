//! Propagation: turns an already-applied write into the byte stream that
//! gets appended to the replication backlog and fanned out to replicas.
//!
//! Mirrors the functional-core split the kernel keeps elsewhere in this
//! workspace: state mutation happens in the command dispatcher (out of
//! scope here), and this module only ever sees the fact that a write
//! happened plus which database it happened against.

use crate::command::{encode_select, Command};
use kiln_types::DbIndex;

/// Tracks which database the propagation stream last selected, so a
/// `SELECT <dbid>` is emitted only when it actually changes.
#[derive(Debug, Default)]
pub struct Propagator {
    current_db: Option<DbIndex>,
}

impl Propagator {
    pub fn new() -> Self {
        Self { current_db: None }
    }

    /// Encodes `cmd` for propagation against `db`, prefixing a `SELECT`
    /// when `db` differs from the last database this propagator selected.
    pub fn propagate(&mut self, db: DbIndex, cmd: &Command) -> Vec<u8> {
        let mut out = Vec::new();
        if self.current_db != Some(db) {
            out.extend_from_slice(&encode_select(db));
            self.current_db = Some(db);
        }
        out.extend_from_slice(&cmd.encode());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_cmd(k: &str) -> Command {
        Command::Set {
            key: k.as_bytes().to_vec(),
            value: b"v".to_vec(),
        }
    }

    #[test]
    fn first_write_always_selects_its_db() {
        let mut p = Propagator::new();
        let bytes = p.propagate(0, &set_cmd("k"));
        assert!(bytes.starts_with(b"*2\r\n$6\r\nSELECT\r\n$1\r\n0\r\n"));
    }

    #[test]
    fn repeated_writes_to_same_db_do_not_reselect() {
        let mut p = Propagator::new();
        let _ = p.propagate(0, &set_cmd("k1"));
        let bytes = p.propagate(0, &set_cmd("k2"));
        assert!(!bytes.windows(6).any(|w| w == b"SELECT"));
    }

    #[test]
    fn db_change_emits_select_exactly_once() {
        let mut p = Propagator::new();
        let _ = p.propagate(0, &set_cmd("k1"));
        let bytes = p.propagate(1, &set_cmd("k2"));
        assert!(bytes.starts_with(b"*2\r\n$6\r\nSELECT\r\n$1\r\n1\r\n"));
        let select_count = bytes.windows(6).filter(|w| *w == b"SELECT").count();
        assert_eq!(select_count, 1);
    }
}
