//! Byte transport seen by the connection protocol
//!
//! The protocol only ever writes and closes; it never waits on the
//! transport. [`StreamTransport`] adapts a non-blocking socket to that by
//! sending what it can immediately and leaving the rest to a writer task:
//!
//! ```text
//!   protocol ── write() ──▶ try_write ──(would block)──▶ outbox ──▶ writer task
//!   protocol ── close() ──────────────────────────────▶ flush, then shutdown
//!                                                              │
//!   reader task ◀──────────────────── EOF ─────────────────────┘
//! ```

use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr};

use coop_core::{Event, SchedResult};
use coop_runtime::TcpStream;

pub trait Transport {
    /// Queue `data` for sending
    ///
    /// Fails if the transport is closing or the socket reported an error.
    fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Close once everything queued has been sent
    fn close(&self);

    fn is_closing(&self) -> bool;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

pub struct StreamTransport {
    stream: TcpStream,
    outbox: RefCell<Vec<u8>>,
    closing: Cell<bool>,
    closed: Cell<bool>,
    work: Event,
}

impl StreamTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            outbox: RefCell::new(Vec::new()),
            closing: Cell::new(false),
            closed: Cell::new(false),
            work: Event::new(),
        }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// True once the socket has been shut down or abandoned
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Stop without flushing, e.g. after the peer went away
    pub fn abort(&self) {
        self.closing.set(true);
        self.closed.set(true);
        self.outbox.borrow_mut().clear();
        self.work.set();
    }

    /// Send queued bytes until the transport is closed
    ///
    /// Runs as a task next to the connection's reader.
    pub async fn run_writer(&self) -> SchedResult<()> {
        loop {
            self.work.wait().await?;
            self.work.clear();

            loop {
                if self.closed.get() {
                    return Ok(());
                }
                let chunk = mem::take(&mut *self.outbox.borrow_mut());
                if chunk.is_empty() {
                    break;
                }
                if let Err(e) = self.stream.write_all(&chunk).await {
                    self.closed.set(true);
                    return Err(e);
                }
            }

            if self.closing.get() {
                self.shutdown();
                return Ok(());
            }
        }
    }

    fn shutdown(&self) {
        self.closed.set(true);
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                tracing::debug!(error = %e, "socket shutdown failed");
            }
        }
    }
}

impl Transport for StreamTransport {
    fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.closing.get() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport is closing"));
        }
        let mut outbox = self.outbox.borrow_mut();
        let mut sent = 0;
        if outbox.is_empty() {
            sent = match self.stream.try_write(data) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => return Err(e),
            };
        }
        if sent < data.len() {
            outbox.extend_from_slice(&data[sent..]);
            self.work.set();
        }
        Ok(())
    }

    fn close(&self) {
        if !self.closing.replace(true) {
            self.work.set();
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.get()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr()
    }
}
