//! The replica side of replication: a linear handshake state machine driven
//! by the inline-protocol replies in `kiln_wire::inline`, plus snapshot
//! reception for both the disk (temp-file-then-rename) and diskless
//! (trailing EOF tag) transfer modes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use kiln_storage::rdb::EOF_TAG_LEN;
use kiln_wire::inline::{encode_inline, InlineReply};

use crate::error::ReplError;

/// Steps of the handshake, in the order a replica walks through them.
/// `None` means "not attempting to replicate" (the replica is a standalone
/// primary or `REPLICAOF NO ONE` was issued).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaLinkState {
    None,
    Connect,
    ReceivePong,
    SendListeningPort,
    SendIp,
    SendCapa,
    SendPsync,
    ReceivePsyncReply,
    /// `PSYNC` drew an error the primary doesn't treat as transient
    /// (anything but `-NOMASTERLINK`/`-LOADING`). Falls back to the legacy,
    /// offset-less `SYNC` command, whose reply is a bare `$<len>\r\n<bytes>`
    /// bulk with no `+FULLRESYNC` preamble.
    LegacySync,
    TransferringSnapshot,
    Connected,
}

/// The primary a replica last fully synced with, retained across a drop so
/// a reconnect can attempt `PSYNC <replid> <offset>` instead of paying for
/// a fresh full resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMaster {
    pub replid: String,
    pub offset: u64,
}

pub struct ReplicaLink {
    state: ReplicaLinkState,
    listening_port: u16,
    announce_ip: String,
    pub cached_master: Option<CachedMaster>,
    legacy_bulk_len: Option<u64>,
}

impl ReplicaLink {
    pub fn new(listening_port: u16, announce_ip: impl Into<String>) -> Self {
        Self {
            state: ReplicaLinkState::None,
            listening_port,
            announce_ip: announce_ip.into(),
            cached_master: None,
            legacy_bulk_len: None,
        }
    }

    pub fn state(&self) -> ReplicaLinkState {
        self.state
    }

    pub fn start(&mut self) {
        self.state = ReplicaLinkState::Connect;
    }

    pub fn stop(&mut self) {
        self.state = ReplicaLinkState::None;
    }

    /// Bulk length announced by a legacy `SYNC` reply, once one has landed.
    /// `None` for every other path (`PSYNC` carries its own length framing
    /// read directly off the wire by the caller).
    pub fn legacy_bulk_len(&self) -> Option<u64> {
        self.legacy_bulk_len
    }

    /// The inline bytes to send for the current step, or `None` if the
    /// current step is waiting on a reply rather than sending.
    pub fn next_send(&self) -> Option<Vec<u8>> {
        match self.state {
            ReplicaLinkState::Connect => Some(encode_inline(&["PING"])),
            ReplicaLinkState::SendListeningPort => Some(encode_inline(&[
                "REPLCONF",
                "listening-port",
                &self.listening_port.to_string(),
            ])),
            ReplicaLinkState::SendIp => {
                Some(encode_inline(&["REPLCONF", "ip-address", &self.announce_ip]))
            }
            ReplicaLinkState::SendCapa => {
                Some(encode_inline(&["REPLCONF", "capa", "eof", "capa", "psync2"]))
            }
            ReplicaLinkState::SendPsync => {
                let (replid, offset) = match &self.cached_master {
                    Some(cached) => (cached.replid.clone(), cached.offset.to_string()),
                    None => ("?".to_string(), "-1".to_string()),
                };
                Some(encode_inline(&["PSYNC", &replid, &offset]))
            }
            ReplicaLinkState::LegacySync => Some(encode_inline(&["SYNC"])),
            _ => None,
        }
    }

    /// Advances the handshake on a reply received for the current step.
    pub fn on_reply(&mut self, reply: InlineReply) -> Result<(), ReplError> {
        match (self.state, reply) {
            (ReplicaLinkState::Connect, InlineReply::Pong) => {
                self.state = ReplicaLinkState::SendListeningPort;
                Ok(())
            }
            (ReplicaLinkState::SendListeningPort, InlineReply::Ok) => {
                self.state = ReplicaLinkState::SendIp;
                Ok(())
            }
            (ReplicaLinkState::SendIp, InlineReply::Ok) => {
                self.state = ReplicaLinkState::SendCapa;
                Ok(())
            }
            (ReplicaLinkState::SendCapa, InlineReply::Ok) => {
                self.state = ReplicaLinkState::SendPsync;
                Ok(())
            }
            (ReplicaLinkState::SendPsync, InlineReply::FullResync { replid, offset }) => {
                self.cached_master = Some(CachedMaster {
                    replid,
                    offset: offset.max(0) as u64,
                });
                self.state = ReplicaLinkState::TransferringSnapshot;
                Ok(())
            }
            (ReplicaLinkState::SendPsync, InlineReply::Continue { replid }) => {
                if let Some(replid) = replid {
                    if let Some(cached) = &mut self.cached_master {
                        cached.replid = replid;
                    }
                }
                self.state = ReplicaLinkState::Connected;
                Ok(())
            }
            (ReplicaLinkState::SendPsync, InlineReply::Error(msg))
                if msg.contains("NOMASTERLINK") || msg.contains("LOADING") =>
            {
                // Transient: stay in `SendPsync` so the next loop iteration
                // resends `PSYNC` rather than treating this as a failure.
                Ok(())
            }
            (ReplicaLinkState::SendPsync, InlineReply::Error(_)) => {
                self.state = ReplicaLinkState::LegacySync;
                Ok(())
            }
            (ReplicaLinkState::LegacySync, InlineReply::BulkLength(len)) => {
                self.legacy_bulk_len = Some(len);
                self.state = ReplicaLinkState::TransferringSnapshot;
                Ok(())
            }
            (state, reply) => Err(ReplError::HandshakeFailed {
                step: state.name(),
                reason: format!("unexpected reply {reply:?}"),
            }),
        }
    }

    /// Called once the snapshot (disk or diskless) has fully landed.
    pub fn snapshot_received(&mut self, applied_offset: u64) {
        if let Some(cached) = &mut self.cached_master {
            cached.offset = applied_offset;
        }
        self.legacy_bulk_len = None;
        self.state = ReplicaLinkState::Connected;
    }
}

impl ReplicaLinkState {
    fn name(self) -> &'static str {
        match self {
            ReplicaLinkState::None => "none",
            ReplicaLinkState::Connect => "connect",
            ReplicaLinkState::ReceivePong => "receive_pong",
            ReplicaLinkState::SendListeningPort => "send_listening_port",
            ReplicaLinkState::SendIp => "send_ip",
            ReplicaLinkState::SendCapa => "send_capa",
            ReplicaLinkState::SendPsync => "send_psync",
            ReplicaLinkState::ReceivePsyncReply => "receive_psync_reply",
            ReplicaLinkState::LegacySync => "legacy_sync",
            ReplicaLinkState::TransferringSnapshot => "transferring_snapshot",
            ReplicaLinkState::Connected => "connected",
        }
    }
}

/// Receives a diskless full resync: the body is framed with a 40-byte EOF
/// tag the replica already knows from the `$EOF:<tag>` reply, so the
/// leading copy is skipped and the trailing copy is what ends the stream.
pub struct DisklessReceiver {
    skip_remaining: usize,
    tag: [u8; EOF_TAG_LEN],
    window: Vec<u8>,
    body: Vec<u8>,
}

impl DisklessReceiver {
    pub fn new(tag: [u8; EOF_TAG_LEN]) -> Self {
        Self {
            skip_remaining: EOF_TAG_LEN,
            tag,
            window: Vec::with_capacity(EOF_TAG_LEN),
            body: Vec::new(),
        }
    }

    pub fn feed(&mut self, byte: u8) {
        if self.skip_remaining > 0 {
            self.skip_remaining -= 1;
            return;
        }
        self.window.push(byte);
        if self.window.len() > EOF_TAG_LEN {
            self.body.push(self.window.remove(0));
        }
    }

    pub fn is_done(&self) -> bool {
        self.window.len() == EOF_TAG_LEN && self.window == self.tag
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// Receives a disk-based full resync: bytes land in a temp file beside the
/// final snapshot path and are renamed into place only once the transfer
/// is complete, so a crash mid-transfer never leaves a half-written
/// snapshot at the real path.
pub struct DiskReceiver {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: fs::File,
}

impl DiskReceiver {
    pub fn create(final_path: impl AsRef<Path>) -> Result<Self, io::Error> {
        let final_path = final_path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("rdb.part");
        let file = fs::File::create(&tmp_path)?;
        Ok(Self {
            tmp_path,
            final_path,
            file,
        })
    }

    pub fn write(&mut self, chunk: &[u8]) -> Result<(), io::Error> {
        use io::Write;
        self.file.write_all(chunk)
    }

    pub fn finish(self) -> Result<PathBuf, io::Error> {
        drop(self.file);
        fs::rename(&self.tmp_path, &self.final_path)?;
        Ok(self.final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_storage::rdb;

    #[test]
    fn handshake_reaches_connected_on_full_resync_path() {
        let mut link = ReplicaLink::new(6380, "10.0.0.1");
        link.start();
        assert_eq!(link.next_send().unwrap(), b"PING\r\n");
        link.on_reply(InlineReply::Pong).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        assert_eq!(link.next_send().unwrap(), b"REPLCONF ip-address 10.0.0.1\r\n");
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::FullResync {
            replid: "abc".to_string(),
            offset: 10,
        })
        .unwrap();
        assert_eq!(link.state(), ReplicaLinkState::TransferringSnapshot);
        link.snapshot_received(10);
        assert_eq!(link.state(), ReplicaLinkState::Connected);
        assert_eq!(
            link.cached_master,
            Some(CachedMaster {
                replid: "abc".to_string(),
                offset: 10
            })
        );
    }

    #[test]
    fn handshake_reaches_connected_directly_on_continue() {
        let mut link = ReplicaLink::new(6380, "10.0.0.1");
        link.start();
        link.on_reply(InlineReply::Pong).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Continue { replid: None })
            .unwrap();
        assert_eq!(link.state(), ReplicaLinkState::Connected);
    }

    #[test]
    fn unexpected_reply_is_a_handshake_error() {
        let mut link = ReplicaLink::new(6380, "10.0.0.1");
        link.start();
        assert!(link.on_reply(InlineReply::Ok).is_err());
    }

    #[test]
    fn psync_uses_cached_master_when_present() {
        let mut link = ReplicaLink::new(6380, "10.0.0.1");
        link.cached_master = Some(CachedMaster {
            replid: "cachedid".to_string(),
            offset: 42,
        });
        link.start();
        link.on_reply(InlineReply::Pong).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        assert_eq!(link.next_send().unwrap(), b"PSYNC cachedid 42\r\n");
    }

    #[test]
    fn partial_resync_happy_path_round_trips_through_both_sides() {
        use crate::primary::{PrimaryEngine, PsyncDecision};

        let mut primary = PrimaryEngine::new("myid123".to_string(), 1024, 64);
        primary.propagate(b"SET a 1");
        primary.propagate(b"SET b 2");

        let mut link = ReplicaLink::new(6380, "10.0.0.1");
        link.cached_master = Some(CachedMaster {
            replid: "myid123".to_string(),
            offset: 0,
        });
        link.start();
        link.on_reply(InlineReply::Pong).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();

        // Replica asks to resume from offset 0; primary's window still has it.
        let decision = primary.handle_psync("myid123", 0);
        let tail = match decision {
            PsyncDecision::Continue { tail } => tail,
            PsyncDecision::FullResync { .. } => panic!("expected a partial resync"),
        };
        assert_eq!(tail, b"SET a 1SET b 2");

        link.on_reply(InlineReply::Continue { replid: None }).unwrap();
        assert_eq!(link.state(), ReplicaLinkState::Connected);
    }

    #[test]
    fn partial_resync_refused_for_an_offset_outside_the_backlog_window() {
        use crate::primary::{PrimaryEngine, PsyncDecision};

        let mut primary = PrimaryEngine::new("myid123".to_string(), 4, 64);
        primary.propagate(b"abcdef");
        let decision = primary.handle_psync("myid123", 0);
        let (replid, offset) = match decision {
            PsyncDecision::FullResync { replid, offset } => (replid, offset),
            PsyncDecision::Continue { .. } => panic!("expected the stale offset to force a full resync"),
        };
        assert_eq!(replid, "myid123");

        let mut link = ReplicaLink::new(6380, "10.0.0.1");
        link.cached_master = Some(CachedMaster {
            replid: "myid123".to_string(),
            offset: 0,
        });
        link.start();
        link.on_reply(InlineReply::Pong).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::FullResync { replid, offset: offset as i64 }).unwrap();
        assert_eq!(link.state(), ReplicaLinkState::TransferringSnapshot);
    }

    #[test]
    fn transient_psync_error_retries_without_changing_state() {
        let mut link = ReplicaLink::new(6380, "10.0.0.1");
        link.start();
        link.on_reply(InlineReply::Pong).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        assert_eq!(link.state(), ReplicaLinkState::SendPsync);

        link.on_reply(InlineReply::Error("NOMASTERLINK".to_string()))
            .unwrap();
        assert_eq!(link.state(), ReplicaLinkState::SendPsync);
        assert_eq!(link.next_send().unwrap(), b"PSYNC ? -1\r\n");

        link.on_reply(InlineReply::Error("LOADING Redis is loading".to_string()))
            .unwrap();
        assert_eq!(link.state(), ReplicaLinkState::SendPsync);
    }

    #[test]
    fn unsupported_psync_error_falls_back_to_legacy_sync() {
        let mut link = ReplicaLink::new(6380, "10.0.0.1");
        link.start();
        link.on_reply(InlineReply::Pong).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();
        link.on_reply(InlineReply::Ok).unwrap();

        link.on_reply(InlineReply::Error("ERR unknown command".to_string()))
            .unwrap();
        assert_eq!(link.state(), ReplicaLinkState::LegacySync);
        assert_eq!(link.next_send().unwrap(), b"SYNC\r\n");

        link.on_reply(InlineReply::BulkLength(128)).unwrap();
        assert_eq!(link.state(), ReplicaLinkState::TransferringSnapshot);
        assert_eq!(link.legacy_bulk_len(), Some(128));

        link.snapshot_received(0);
        assert_eq!(link.legacy_bulk_len(), None);
    }

    #[test]
    fn diskless_receiver_recovers_exact_body() {
        let body = b"fake rdb body bytes".to_vec();
        let (tag, framed) = rdb::frame_diskless(&body);
        let mut recv = DisklessReceiver::new(tag);
        for &byte in &framed {
            recv.feed(byte);
        }
        assert!(recv.is_done());
        assert_eq!(recv.into_body(), body);
    }

    #[test]
    fn disk_receiver_renames_into_place_on_finish() {
        let dir = std::env::temp_dir().join(format!("kiln-repl-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let final_path = dir.join("dump.rdb");
        let mut recv = DiskReceiver::create(&final_path).unwrap();
        recv.write(b"snapshot bytes").unwrap();
        let written_path = recv.finish().unwrap();
        assert_eq!(written_path, final_path);
        assert_eq!(fs::read(&final_path).unwrap(), b"snapshot bytes");
        fs::remove_dir_all(&dir).ok();
    }
}
