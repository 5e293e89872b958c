//! Per-client connection state: read/write buffering around a non-blocking
//! `mio` socket, and RESP frame decoding off the accumulated read buffer.

use std::io::{self, Read, Write};
use std::time::Instant;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Token};

use kiln_wire::resp::{self, Frame};
use kiln_wire::WireError;

pub struct Connection {
    pub token: Token,
    pub stream: TcpStream,
    pub read_buf: BytesMut,
    pub write_buf: BytesMut,
    pub closing: bool,
    pub last_activity: Instant,
    /// The database this connection last issued `SELECT` against.
    pub db: u32,
}

impl Connection {
    pub fn new(token: Token, stream: TcpStream, buffer_size: usize) -> Self {
        Self::with_buffers(
            token,
            stream,
            BytesMut::with_capacity(buffer_size),
            BytesMut::with_capacity(buffer_size),
        )
    }

    /// Builds a connection from buffers checked out of a [`crate::BytesMutPool`],
    /// so the pool — not a fresh allocation — backs every connection's
    /// read/write buffers.
    pub fn with_buffers(
        token: Token,
        stream: TcpStream,
        read_buf: BytesMut,
        write_buf: BytesMut,
    ) -> Self {
        Self {
            token,
            stream,
            read_buf,
            write_buf,
            closing: false,
            last_activity: Instant::now(),
            db: 0,
        }
    }

    /// Takes the buffers back out, clearing connection-specific bytes so
    /// they can be returned to a pool for reuse.
    pub fn take_buffers(self) -> (BytesMut, BytesMut) {
        (self.read_buf, self.write_buf)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_idle(&self, timeout: std::time::Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    /// Reads everything currently available from the socket into
    /// `read_buf`. Returns `false` once the peer has closed its end.
    pub fn read(&mut self) -> io::Result<bool> {
        let mut temp_buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut temp_buf) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_buf.extend_from_slice(&temp_buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) => return Err(e),
            }
        }
    }

    /// Flushes `write_buf` to the socket. Returns `true` once everything
    /// queued has been written; `false` means the socket would block and
    /// the caller should wait for another writable event.
    pub fn write(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ))
                }
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Pulls one complete multi-bulk command's argv out of the read
    /// buffer, if one has fully arrived.
    pub fn try_decode_command(&mut self) -> Result<Option<Vec<Vec<u8>>>, WireError> {
        match resp::parse_frame(&self.read_buf)? {
            None => Ok(None),
            Some((frame, consumed)) => {
                let args = match &frame {
                    Frame::Array(_) => resp::frame_as_args(&frame)?
                        .into_iter()
                        .map(|s| s.to_vec())
                        .collect(),
                    _ => {
                        return Err(WireError::ProtocolViolation(
                            "expected a multibulk command array",
                        ))
                    }
                };
                let _ = self.read_buf.split_to(consumed);
                Ok(Some(args))
            }
        }
    }

    pub fn queue(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    pub fn interest(&self) -> Interest {
        if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }
}
