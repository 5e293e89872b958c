//! The mio event loop: accepts client connections, drives each through the
//! dispatcher, and runs the cron tick (active-expire sampling, idle
//! connection reaping) on every poll timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use kiln_repl::{PrimaryEngine, PsyncDecision, ReplicaId, ReplicaState};
use kiln_types::DbIndex;

use crate::buffer_pool::BytesMutPool;
use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::error::{ServerError, ServerResult};

const LISTENER_TOKEN: Token = Token(0);

pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub buffer_size: usize,
    pub idle_timeout: Duration,
    pub cron_interval: Duration,
    pub active_expire_sample_size: usize,
    pub active_expire_db_count: DbIndex,
    /// Serve full resyncs over the replica socket directly (EOF-tag framed)
    /// instead of generating a `$<len>` bulk up front. The replica goes
    /// `OnlinePendingAck` rather than straight to `Online` so its output
    /// queue stays quiet until the first `REPLCONF ACK` confirms the
    /// snapshot installed, matching §4.5's diskless ordering guarantee.
    pub diskless_sync: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:6380".parse().unwrap(),
            buffer_size: 16 * 1024,
            idle_timeout: Duration::from_secs(300),
            cron_interval: Duration::from_millis(100),
            active_expire_sample_size: 20,
            active_expire_db_count: 16,
            diskless_sync: false,
        }
    }
}

/// Lets the caller (the daemon's `main`) request a clean stop from a signal
/// handler without sharing mutable state with the event loop thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Server {
    listener: TcpListener,
    poll: Poll,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    dispatcher: Dispatcher,
    primary: PrimaryEngine,
    config: ServerConfig,
    shutdown: ShutdownHandle,
    buf_pool: BytesMutPool,
    /// Connections that completed a `PSYNC` handshake and are now fed from
    /// the primary engine's per-replica output queue instead of getting
    /// direct command replies.
    replica_tokens: HashMap<Token, ReplicaId>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        dispatcher: Dispatcher,
        primary: PrimaryEngine,
        shutdown: ShutdownHandle,
    ) -> ServerResult<Self> {
        let mut listener =
            TcpListener::bind(config.bind_addr).map_err(|source| ServerError::BindFailed {
                addr: config.bind_addr,
                source,
            })?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let buf_pool = BytesMutPool::new(256, config.buffer_size);
        Ok(Self {
            listener,
            poll,
            connections: HashMap::new(),
            next_token: 1,
            dispatcher,
            primary,
            config,
            buf_pool,
            shutdown,
            replica_tokens: HashMap::new(),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn run(&mut self) -> ServerResult<()> {
        let mut events = Events::with_capacity(1024);
        info!(addr = %self.config.bind_addr, "server listening");

        while !self.shutdown.requested() {
            self.poll
                .poll(&mut events, Some(self.config.cron_interval))?;

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_all()?,
                    token => {
                        if let Err(e) = self.service_connection(token) {
                            debug!(?token, error = %e, "closing connection after error");
                            self.close(token);
                        }
                    }
                }
            }

            self.drain_replica_output()?;

            // Runs whether or not the poll returned events: the cron
            // interval doubles as the poll timeout, so a quiet socket set
            // still ticks expiration and idle reaping on schedule.
            self.cron_tick();
        }
        info!("server shutting down");
        Ok(())
    }

    fn accept_all(&mut self) -> ServerResult<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE,
                    )?;
                    debug!(%addr, ?token, "accepted connection");
                    let conn = Connection::with_buffers(
                        token,
                        stream,
                        self.buf_pool.get(),
                        self.buf_pool.get(),
                    );
                    self.connections.insert(token, conn);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn service_connection(&mut self, token: Token) -> ServerResult<()> {
        let now_secs = now();
        {
            let conn = self
                .connections
                .get_mut(&token)
                .ok_or(ServerError::ConnectionClosed)?;
            if !conn.read()? {
                conn.closing = true;
            }
            conn.touch();
        }

        loop {
            let command = self
                .connections
                .get_mut(&token)
                .ok_or(ServerError::ConnectionClosed)?
                .try_decode_command()?;
            let Some(args) = command else { break };
            if args.is_empty() {
                continue;
            }
            let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
            match name.as_str() {
                "REPLCONF" => self.handle_replconf(token, &args, now_secs)?,
                "PSYNC" => {
                    self.handle_psync(token, &args)?;
                    // The connection is now a replica stream; further
                    // bytes on it are ACKs, drained by `drain_replica_output`
                    // rather than dispatched as ordinary commands.
                    break;
                }
                _ => {
                    let mut db = self
                        .connections
                        .get(&token)
                        .ok_or(ServerError::ConnectionClosed)?
                        .db;
                    let (reply, propagated) = self.dispatcher.execute(&mut db, &args, now_secs)?;
                    let conn = self
                        .connections
                        .get_mut(&token)
                        .ok_or(ServerError::ConnectionClosed)?;
                    conn.db = db;
                    conn.queue(&reply);
                    if let Some(bytes) = propagated {
                        self.primary.propagate(&bytes);
                    }
                }
            }
        }

        let conn = self
            .connections
            .get_mut(&token)
            .ok_or(ServerError::ConnectionClosed)?;
        let flushed = conn.write()?;
        let interest = conn.interest();
        self.poll
            .registry()
            .reregister(&mut conn.stream, token, interest)?;

        if conn.closing && flushed {
            self.close(token);
        }
        Ok(())
    }

    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            let (read_buf, write_buf) = conn.take_buffers();
            self.buf_pool.put(read_buf);
            self.buf_pool.put(write_buf);
        }
        if let Some(id) = self.replica_tokens.remove(&token) {
            self.primary.remove_replica(id);
        }
    }

    /// `REPLCONF listening-port`/`capa` are handshake pleasantries a
    /// connecting replica sends before `PSYNC`; `REPLCONF ACK <offset>` is
    /// how an already-online replica reports how far it has applied.
    fn handle_replconf(&mut self, token: Token, args: &[Vec<u8>], now_secs: u64) -> ServerResult<()> {
        let sub = args
            .get(1)
            .map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
            .unwrap_or_default();
        if sub == "ACK" {
            if let (Some(&id), Some(offset)) = (
                self.replica_tokens.get(&token),
                args.get(2).and_then(|a| std::str::from_utf8(a).ok()?.parse().ok()),
            ) {
                self.primary.ack(id, offset, now_secs).ok();
            }
            // ACKs are not replied to, matching the real protocol.
            return Ok(());
        }
        let conn = self
            .connections
            .get_mut(&token)
            .ok_or(ServerError::ConnectionClosed)?;
        conn.queue(&kiln_wire::resp::encode_simple_string("OK"));
        Ok(())
    }

    /// Decides full vs. partial resync, queues the handshake reply plus
    /// the snapshot/backlog-tail bytes, and promotes the connection to a
    /// replica stream fed by `drain_replica_output`.
    fn handle_psync(&mut self, token: Token, args: &[Vec<u8>]) -> ServerResult<()> {
        let requested_replid = args
            .get(1)
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .unwrap_or_else(|| "?".to_string());
        let requested_offset: i64 = args
            .get(2)
            .and_then(|a| std::str::from_utf8(a).ok()?.parse().ok())
            .unwrap_or(-1);

        let decision = self.primary.handle_psync(&requested_replid, requested_offset);
        let id = self.primary.register_replica();
        self.replica_tokens.insert(token, id);

        let mut out = Vec::new();
        // A synchronous, non-forked snapshot has no separate "generating"
        // window to model, so a disk-framed replica goes straight to
        // `Online` once the bytes below are queued; a diskless one waits
        // for the first ack instead (see `ServerConfig::diskless_sync`).
        let mut next_state = ReplicaState::Online;
        match decision {
            PsyncDecision::FullResync { replid, offset } => {
                out.extend_from_slice(format!("+FULLRESYNC {replid} {offset}\r\n").as_bytes());
                let offset_str = offset.to_string();
                let aux = [
                    ("redis-ver", "kiln-1.0"),
                    ("repl-id", replid.as_str()),
                    ("repl-offset", offset_str.as_str()),
                ];
                let snapshot = kiln_storage::rdb::save(&self.dispatcher.keyspace, &aux)
                    .map_err(|e| ServerError::Replication(e.to_string()))?;
                if self.config.diskless_sync {
                    let (_tag, framed) = kiln_storage::rdb::frame_diskless(&snapshot);
                    out.extend_from_slice(b"$EOF:");
                    out.extend_from_slice(&framed[..kiln_storage::rdb::EOF_TAG_LEN]);
                    out.extend_from_slice(b"\r\n");
                    out.extend_from_slice(&framed);
                    next_state = ReplicaState::OnlinePendingAck;
                } else {
                    out.extend_from_slice(format!("${}\r\n", snapshot.len()).as_bytes());
                    out.extend_from_slice(&snapshot);
                }
            }
            PsyncDecision::Continue { tail } => {
                out.extend_from_slice(b"+CONTINUE\r\n");
                out.extend_from_slice(&tail);
            }
        }
        self.primary.set_state(id, next_state).ok();

        let conn = self
            .connections
            .get_mut(&token)
            .ok_or(ServerError::ConnectionClosed)?;
        conn.queue(&out);
        info!(?token, replica_id = id, "replica attached");
        Ok(())
    }

    /// Flushes each attached replica's pending propagated bytes into its
    /// socket's write buffer. Runs once per loop iteration, independent of
    /// whether that replica's own socket produced a poll event.
    fn drain_replica_output(&mut self) -> ServerResult<()> {
        let tokens: Vec<Token> = self.replica_tokens.keys().copied().collect();
        for token in tokens {
            let Some(&id) = self.replica_tokens.get(&token) else {
                continue;
            };
            let Some(replica) = self.primary.replica(id) else {
                continue;
            };
            let output = replica.output_handle();
            let mut queued = false;
            while let Some(bytes) = output.pop() {
                if let Some(conn) = self.connections.get_mut(&token) {
                    conn.queue(&bytes);
                    queued = true;
                }
            }
            if !queued {
                continue;
            }
            if let Some(conn) = self.connections.get_mut(&token) {
                conn.write()?;
                let interest = conn.interest();
                self.poll
                    .registry()
                    .reregister(&mut conn.stream, token, interest)?;
            }
        }
        Ok(())
    }

    /// Active-expire sampling and idle-connection reaping, run on every
    /// poll timeout regardless of whether any socket was ready.
    fn cron_tick(&mut self) {
        if let Some(rate) = self.buf_pool.hit_rate() {
            if rate < 0.5 {
                debug!(hit_rate = rate, "buffer pool reuse rate is low");
            }
        }

        let now_secs = now();
        for db in 0..self.config.active_expire_db_count {
            let reaped = self.dispatcher.keyspace.active_expire_cycle(
                db,
                self.config.active_expire_sample_size,
                now_secs,
            );
            if reaped > 0 {
                debug!(db, reaped, "active expire cycle");
            }
        }

        let idle: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, c)| c.is_idle(self.config.idle_timeout))
            .map(|(t, _)| *t)
            .collect();
        for token in idle {
            warn!(?token, "closing idle connection");
            self.close(token);
        }
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
