//! Wires `kiln-config` → `kiln-storage::Keyspace` → `kiln-repl` →
//! `kiln-server`'s event loop into the two runnable daemon shapes:
//! primary (serves clients, fans writes out to attached replicas) and
//! replica (attaches to a primary, applies its stream into a local
//! keyspace). `main.rs` is a thin CLI wrapper around what's here.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tracing::{info, warn};

use kiln_config::Settings;
use kiln_repl::{generate_replid, DisklessReceiver, PrimaryEngine, ReplicaLink, ReplicaLinkState};
use kiln_server::{Dispatcher, Server, ServerConfig, ShutdownHandle};
use kiln_storage::rdb;
use kiln_storage::Keyspace;
use kiln_wire::inline::{self, InlineReply};
use kiln_wire::resp;

use crate::error::KilnError;

pub type Result<T> = std::result::Result<T, KilnError>;

pub fn build_keyspace(settings: &Settings) -> Keyspace {
    Keyspace::new(settings.db_count as usize, settings.maxmemory_policy.into())
}

/// Assembles a primary server ready to `run()`. Split out from `run()`
/// itself so `main` can grab the shutdown handle before blocking.
pub fn build_primary_server(settings: &Settings) -> Result<Server> {
    let keyspace = build_keyspace(settings);
    let dispatcher = Dispatcher::new(keyspace);
    let primary = PrimaryEngine::new(
        generate_replid(),
        settings.replication.backlog_capacity,
        1024,
    );
    let bind_addr: SocketAddr = settings
        .bind_address
        .parse()
        .map_err(|_| KilnError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid bind address {}", settings.bind_address),
        )))?;
    let server_config = ServerConfig {
        bind_addr,
        active_expire_db_count: settings.db_count,
        diskless_sync: settings.replication.diskless_sync,
        ..ServerConfig::default()
    };
    let server = Server::new(server_config, dispatcher, primary, ShutdownHandle::new())?;
    Ok(server)
}

/// Attaches to `primary_addr` as a replica: walks the handshake, installs
/// the resulting snapshot (or backlog tail) into a freshly built keyspace,
/// then applies the live command stream until `shutdown` is requested.
///
/// This does not also serve client reads over RESP — doing so would mean
/// sharing the keyspace between this ingest loop and `kiln-server`'s
/// single-owner `Dispatcher`, which this daemon's scope doesn't call for.
/// It is enough to exercise the replica engine end to end.
pub fn run_replica(
    settings: &Settings,
    primary_addr: SocketAddr,
    shutdown: ShutdownHandle,
) -> Result<()> {
    let keyspace = build_keyspace(settings);
    let mut dispatcher = Dispatcher::new(keyspace);

    let mut stream = TcpStream::connect(primary_addr)?;
    stream.set_read_timeout(Some(Duration::from_millis(200)))?;
    stream.set_nodelay(true).ok();

    let listening_port = local_port(&settings.bind_address);
    let mut link = ReplicaLink::new(listening_port, settings.replication.announce_ip.clone());
    link.start();

    let mut inbuf: Vec<u8> = Vec::new();
    loop {
        if let Some(bytes) = link.next_send() {
            stream.write_all(&bytes)?;
        }
        if link.state() == ReplicaLinkState::TransferringSnapshot {
            break;
        }
        if link.state() == ReplicaLinkState::Connected {
            // `PSYNC` answered `+CONTINUE`; nothing to install.
            break;
        }
        let Some(line) = read_line_blocking(&mut stream, &mut inbuf, &shutdown)? else {
            continue;
        };
        link.on_reply(inline::parse_inline_reply(&line))?;
    }

    if link.state() == ReplicaLinkState::TransferringSnapshot {
        let body = if let Some(len) = link.legacy_bulk_len() {
            read_exact_bulk(&mut stream, &mut inbuf, &shutdown, len as usize)?
        } else {
            read_full_resync_body(&mut stream, &mut inbuf, &shutdown)?
        };
        let snapshot = rdb::load(&body)?;
        rdb::install(&mut dispatcher.keyspace, snapshot, 0);
        let applied_offset = link
            .cached_master
            .as_ref()
            .map(|c| c.offset)
            .unwrap_or(0);
        link.snapshot_received(applied_offset);
        info!(offset = applied_offset, "full resync applied");
    } else {
        info!("partial resync: continuing from cached offset");
    }

    info!("replica online, applying live stream");
    let mut db: kiln_types::DbIndex = 0;
    let mut applied: u64 = link.cached_master.as_ref().map(|c| c.offset).unwrap_or(0);
    loop {
        match resp::parse_frame(&inbuf) {
            Ok(Some((frame, consumed))) => {
                if let Ok(args) = resp::frame_as_args(&frame) {
                    let owned: Vec<Vec<u8>> = args.into_iter().map(|a| a.to_vec()).collect();
                    applied += consumed as u64;
                    if let Err(e) = dispatcher.execute(&mut db, &owned, 0) {
                        warn!(error = %e, "failed to apply replicated command");
                    }
                }
                inbuf.drain(0..consumed);
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "dropping malformed bytes from replication stream");
                inbuf.clear();
            }
        }
        if shutdown_requested(&shutdown) {
            return Ok(());
        }
        let Some(chunk) = read_some(&mut stream)? else {
            continue;
        };
        if chunk.is_empty() {
            return Ok(());
        }
        inbuf.extend_from_slice(&chunk);
        if let Some(master) = &mut link.cached_master {
            master.offset = applied;
        }
        let ack = inline::encode_inline(&["REPLCONF", "ACK", &applied.to_string()]);
        stream.write_all(&ack)?;
    }
}

fn local_port(bind_address: &str) -> u16 {
    bind_address
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(6380)
}

fn shutdown_requested(handle: &ShutdownHandle) -> bool {
    handle.requested()
}

fn read_some(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut tmp = [0u8; 4096];
    match stream.read(&mut tmp) {
        Ok(n) => Ok(Some(tmp[..n].to_vec())),
        Err(ref e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn read_line_blocking(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    shutdown: &ShutdownHandle,
) -> Result<Option<Vec<u8>>> {
    if let Some((line, consumed)) = inline::read_line(buf) {
        let line = line.to_vec();
        buf.drain(0..consumed);
        return Ok(Some(line));
    }
    if shutdown_requested(shutdown) {
        return Ok(None);
    }
    if let Some(chunk) = read_some(stream)? {
        buf.extend_from_slice(&chunk);
    }
    Ok(None)
}

/// Reads the body of a `+FULLRESYNC` full resync: the `$<len>\r\n` header
/// (disk target) or `$EOF:<tag>\r\n` header (diskless target) hasn't been
/// consumed yet at this point, so this peeks that line itself and branches.
fn read_full_resync_body(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    shutdown: &ShutdownHandle,
) -> Result<Vec<u8>> {
    loop {
        if let Some((line, consumed)) = inline::read_line(buf) {
            let reply = inline::parse_inline_reply(line);
            buf.drain(0..consumed);
            match reply {
                InlineReply::BulkLength(n) => return read_exact_bulk(stream, buf, shutdown, n as usize),
                InlineReply::EofBulk { tag } => return read_diskless_bulk(stream, buf, shutdown, tag),
                _ => continue,
            }
        }
        if shutdown_requested(shutdown) {
            return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "shutdown").into());
        }
        if let Some(chunk) = read_some(stream)? {
            buf.extend_from_slice(&chunk);
        }
    }
}

/// Reads exactly `len` raw bytes once a bulk length is already known, for
/// both the disk-framed `$<len>` body and the legacy `SYNC` reply (whose
/// length `ReplicaLink` already recorded off the wire itself).
fn read_exact_bulk(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    shutdown: &ShutdownHandle,
    len: usize,
) -> Result<Vec<u8>> {
    while buf.len() < len {
        if shutdown_requested(shutdown) {
            return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "shutdown").into());
        }
        if let Some(chunk) = read_some(stream)? {
            buf.extend_from_slice(&chunk);
        }
    }
    let body: Vec<u8> = buf.drain(0..len).collect();
    Ok(body)
}

/// Reads a diskless full resync body: no length is announced up front, so
/// bytes are fed one at a time into a `DisklessReceiver` until its trailing
/// 40-byte tag closes the stream.
fn read_diskless_bulk(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    shutdown: &ShutdownHandle,
    tag: [u8; rdb::EOF_TAG_LEN],
) -> Result<Vec<u8>> {
    let mut recv = DisklessReceiver::new(tag);
    loop {
        let mut consumed = 0;
        while consumed < buf.len() && !recv.is_done() {
            recv.feed(buf[consumed]);
            consumed += 1;
        }
        buf.drain(0..consumed);
        if recv.is_done() {
            return Ok(recv.into_body());
        }
        if shutdown_requested(shutdown) {
            return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "shutdown").into());
        }
        if let Some(chunk) = read_some(stream)? {
            buf.extend_from_slice(&chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_port_parses_the_port_out_of_a_bind_address() {
        assert_eq!(local_port("0.0.0.0:6380"), 6380);
        assert_eq!(local_port("127.0.0.1:7000"), 7000);
    }

    #[test]
    fn local_port_falls_back_to_the_default_port_on_garbage() {
        assert_eq!(local_port("not an address"), 6380);
    }

    #[test]
    fn build_keyspace_honors_configured_db_count() {
        let mut settings = Settings::default();
        settings.db_count = 4;
        let keyspace = build_keyspace(&settings);
        assert_eq!(keyspace.db_count(), 4);
    }

    #[test]
    fn read_diskless_bulk_recovers_the_body_split_across_reads() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let body = b"diskless snapshot bytes".to_vec();
        let (tag, framed) = kiln_storage::rdb::frame_diskless(&body);

        let writer = {
            let framed = framed.clone();
            std::thread::spawn(move || {
                let (mut stream, _) = listener.accept().unwrap();
                // Split the write in two to exercise the multi-read path.
                let mid = framed.len() / 2;
                stream.write_all(&framed[..mid]).unwrap();
                std::thread::sleep(Duration::from_millis(20));
                stream.write_all(&framed[mid..]).unwrap();
            })
        };

        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = Vec::new();
        let shutdown = ShutdownHandle::new();
        let recovered = read_diskless_bulk(&mut stream, &mut buf, &shutdown, tag).unwrap();
        assert_eq!(recovered, body);
        writer.join().unwrap();
    }

    #[test]
    fn build_primary_server_rejects_an_unparseable_bind_address() {
        let mut settings = Settings::default();
        settings.bind_address = "not an address".to_string();
        assert!(build_primary_server(&settings).is_err());
    }
}
