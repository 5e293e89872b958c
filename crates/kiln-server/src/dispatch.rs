//! Minimal command execution: the glue between a decoded RESP command and
//! the keyspace, wide enough to exercise the propagation path end to end.
//! A full command table belongs to a richer client-facing layer than this
//! exercise covers; this dispatcher only implements what's needed to turn
//! a keyspace write into bytes on the wire and bytes in the backlog.

use kiln_kernel::{Command, Propagator};
use kiln_storage::Keyspace;
use kiln_types::{DbIndex, Object, StringRepr, ValueRepr};
use kiln_wire::resp;

use crate::error::ServerResult;

pub struct Dispatcher {
    pub keyspace: Keyspace,
    pub propagator: Propagator,
}

impl Dispatcher {
    pub fn new(keyspace: Keyspace) -> Self {
        Self {
            keyspace,
            propagator: Propagator::new(),
        }
    }

    /// Executes one command against `db`, returning the reply bytes to
    /// send back to the client and, for writes, the bytes to propagate
    /// (already `SELECT`-prefixed as needed).
    pub fn execute(
        &mut self,
        db: &mut DbIndex,
        args: &[Vec<u8>],
        now_secs: u64,
    ) -> ServerResult<(Vec<u8>, Option<Vec<u8>>)> {
        let Some(name) = args.first() else {
            return Ok((resp::encode_error("ERR empty command"), None));
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();

        match name.as_str() {
            "PING" => Ok((resp::encode_simple_string("PONG"), None)),
            "SELECT" => match args.get(1).and_then(|a| parse_u32(a)) {
                Some(n) => {
                    *db = n;
                    Ok((resp::encode_simple_string("OK"), None))
                }
                None => Ok((resp::encode_error("ERR invalid DB index"), None)),
            },
            "GET" => {
                let Some(key) = args.get(1) else {
                    return Ok((resp::encode_error("ERR wrong number of arguments"), None));
                };
                match self.keyspace.get(*db, key, now_secs) {
                    Some(obj) => match obj.value().repr.as_string() {
                        Ok(s) => Ok((resp::encode_bulk_string(&s.as_bytes_owned()), None)),
                        Err(_) => Ok((
                            resp::encode_error("WRONGTYPE Operation against a key holding the wrong kind of value"),
                            None,
                        )),
                    },
                    None => Ok((resp::encode_bulk_string_nil(), None)),
                }
            }
            "SET" => {
                let (Some(key), Some(value)) = (args.get(1), args.get(2)) else {
                    return Ok((resp::encode_error("ERR wrong number of arguments"), None));
                };
                self.keyspace.put(
                    *db,
                    key.clone(),
                    Object::owned(ValueRepr::Str(StringRepr::try_encode(value)), now_secs as u32),
                );
                let cmd = Command::Set {
                    key: key.clone(),
                    value: value.clone(),
                };
                let propagated = self.propagator.propagate(*db, &cmd);
                Ok((resp::encode_simple_string("OK"), Some(propagated)))
            }
            "DEL" => {
                let keys = &args[1..];
                let mut removed = 0i64;
                for key in keys {
                    if self.keyspace.delete(*db, key) {
                        removed += 1;
                    }
                }
                let propagated = if removed > 0 {
                    let cmd = Command::Del {
                        keys: keys.to_vec(),
                    };
                    Some(self.propagator.propagate(*db, &cmd))
                } else {
                    None
                };
                Ok((resp::encode_integer(removed), propagated))
            }
            "EXPIREAT" => {
                let (Some(key), Some(at)) = (args.get(1), args.get(2).and_then(|a| parse_u64(a))) else {
                    return Ok((resp::encode_error("ERR invalid arguments"), None));
                };
                let ok = self.keyspace.set_expire(*db, key, at);
                let propagated = ok.then(|| {
                    let cmd = Command::ExpireAt {
                        key: key.clone(),
                        at_secs: at,
                    };
                    self.propagator.propagate(*db, &cmd)
                });
                Ok((resp::encode_integer(ok as i64), propagated))
            }
            "PERSIST" => {
                let Some(key) = args.get(1) else {
                    return Ok((resp::encode_error("ERR wrong number of arguments"), None));
                };
                let ok = self.keyspace.persist(*db, key);
                let propagated = ok.then(|| {
                    let cmd = Command::Persist { key: key.clone() };
                    self.propagator.propagate(*db, &cmd)
                });
                Ok((resp::encode_integer(ok as i64), propagated))
            }
            "FLUSHALL" => {
                self.keyspace.flush_all();
                let propagated = self.propagator.propagate(*db, &Command::FlushAll);
                Ok((resp::encode_simple_string("OK"), Some(propagated)))
            }
            _ => Ok((
                resp::encode_error(&format!("ERR unknown command '{name}'")),
                None,
            )),
        }
    }
}

fn parse_u32(bytes: &[u8]) -> Option<u32> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

fn parse_u64(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::EvictionPolicy;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Keyspace::new(4, EvictionPolicy::NoEviction))
    }

    #[test]
    fn set_then_get_roundtrips_and_propagates() {
        let mut d = dispatcher();
        let mut db = 0;
        let (reply, propagated) = d
            .execute(&mut db, &[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()], 0)
            .unwrap();
        assert_eq!(reply, b"+OK\r\n");
        assert!(propagated.is_some());

        let (reply, propagated) = d.execute(&mut db, &[b"GET".to_vec(), b"k".to_vec()], 0).unwrap();
        assert_eq!(reply, b"$1\r\nv\r\n");
        assert!(propagated.is_none());
    }

    #[test]
    fn select_switches_the_connection_db() {
        let mut d = dispatcher();
        let mut db = 0;
        d.execute(&mut db, &[b"SELECT".to_vec(), b"2".to_vec()], 0)
            .unwrap();
        assert_eq!(db, 2);
    }

    #[test]
    fn del_only_propagates_when_something_was_removed() {
        let mut d = dispatcher();
        let mut db = 0;
        d.execute(&mut db, &[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()], 0)
            .unwrap();
        let (reply, propagated) = d.execute(&mut db, &[b"DEL".to_vec(), b"missing".to_vec()], 0).unwrap();
        assert_eq!(reply, b":0\r\n");
        assert!(propagated.is_none());

        let (reply, propagated) = d.execute(&mut db, &[b"DEL".to_vec(), b"k".to_vec()], 0).unwrap();
        assert_eq!(reply, b":1\r\n");
        assert!(propagated.is_some());
    }
}
