//! The small slice of write commands this core needs to exercise
//! propagation end to end. The full command table (every data-type
//! operation) is the command dispatcher's job and stays out of scope;
//! this crate only needs enough shapes to prove that a write reaching the
//! keyspace gets serialized once and fed to the backlog and every replica.

use kiln_types::DbIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: Vec<u8>, value: Vec<u8> },
    Del { keys: Vec<Vec<u8>> },
    ExpireAt { key: Vec<u8>, at_secs: u64 },
    Persist { key: Vec<u8> },
    FlushAll,
}

impl Command {
    /// Serializes into the canonical multi-bulk wire form (spec.md §4.5:
    /// "every write command... is serialized once into the canonical
    /// wire form").
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Set { key, value } => {
                kiln_wire::resp::encode_multibulk(&[b"SET", key, value])
            }
            Command::Del { keys } => {
                let mut args: Vec<&[u8]> = vec![b"DEL"];
                args.extend(keys.iter().map(Vec::as_slice));
                kiln_wire::resp::encode_multibulk(&args)
            }
            Command::ExpireAt { key, at_secs } => {
                let secs = at_secs.to_string();
                kiln_wire::resp::encode_multibulk(&[b"EXPIREAT", key, secs.as_bytes()])
            }
            Command::Persist { key } => kiln_wire::resp::encode_multibulk(&[b"PERSIST", key]),
            Command::FlushAll => kiln_wire::resp::encode_multibulk(&[b"FLUSHALL"]),
        }
    }
}

/// `SELECT <dbid>\r\n` in multi-bulk form, emitted ahead of a command
/// whenever the propagation stream's current database differs from it.
pub fn encode_select(db: DbIndex) -> Vec<u8> {
    let dbid = db.to_string();
    kiln_wire::resp::encode_multibulk(&[b"SELECT", dbid.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_encodes_as_three_element_multibulk() {
        let cmd = Command::Set {
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        };
        assert_eq!(cmd.encode(), b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[test]
    fn del_encodes_variable_argc() {
        let cmd = Command::Del {
            keys: vec![b"a".to_vec(), b"b".to_vec()],
        };
        assert_eq!(cmd.encode(), b"*3\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n");
    }
}
