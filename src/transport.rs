//! Non blocking byte transports that sessions drive through readiness polls.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{self, SocketAddr};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

/// Identity of a socket inside the scheduler readiness table.
///
/// Holding a SocketId is a relation plus a lookup, never ownership of the
/// socket lifecycle, which stays with the session.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct SocketId(usize);

static NEXT_SOCKET_ID: AtomicUsize = AtomicUsize::new(1);

fn next_socket_id() -> SocketId {
    SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
}

/// Byte transport whose operations never block.
///
/// Reads and writes return `WouldBlock` instead of waiting, readiness is
/// observable through zero wait polls.
pub trait Transport: Read + Write {
    /// Identity of the underlying socket for readiness registration.
    fn socket_id(&self) -> SocketId;

    /// Zero wait check whether a read would make progress right now.
    fn poll_readable(&mut self) -> io::Result<bool>;

    /// Zero wait check whether a write would make progress right now.
    fn poll_writable(&mut self) -> io::Result<bool>;

    /// Whether the transport is still open on our side.
    fn is_open(&self) -> bool;

    /// Address of the remote peer.
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

// ----------------------------------------------------------------------------//

const EVENTS_CAPACITY: usize = 4;

/// Transport over a non blocking tcp stream.
///
/// Readiness is tracked with sticky flags that a zero timeout poll sweep
/// raises and a `WouldBlock` result lowers, so repeated zero wait checks do
/// not lose edges between scheduler passes.
pub struct TcpTransport {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    id: SocketId,
    readable: bool,
    writable: bool,
    open: bool,
}

impl TcpTransport {
    /// Start a non blocking connection attempt to the given remote address.
    pub fn connect(addr: SocketAddr) -> io::Result<TcpTransport> {
        let stream = TcpStream::connect(addr)?;

        TcpTransport::from_mio_stream(stream)
    }

    /// Wrap an accepted standard stream, switching it to non blocking mode.
    pub fn from_stream(stream: net::TcpStream) -> io::Result<TcpTransport> {
        stream.set_nonblocking(true)?;

        TcpTransport::from_mio_stream(TcpStream::from_std(stream))
    }

    fn from_mio_stream(mut stream: TcpStream) -> io::Result<TcpTransport> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, Token(0), Interest::READABLE | Interest::WRITABLE)?;

        Ok(TcpTransport {
            stream: stream,
            poll: poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            id: next_socket_id(),
            readable: false,
            writable: false,
            open: true,
        })
    }

    /// Run a zero timeout readiness sweep and merge the results into our
    /// sticky flags.
    fn sweep(&mut self) -> io::Result<()> {
        self.poll.poll(&mut self.events, Some(Duration::from_millis(0)))?;

        for event in self.events.iter() {
            if event.is_readable() {
                self.readable = true;
            }
            if event.is_writable() {
                self.writable = true;
            }
            if event.is_read_closed() || event.is_write_closed() {
                // Keep readable raised so buffered bytes still drain, the
                // next read observing eof closes the transport.
                self.readable = true;
            }
        }

        Ok(())
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.open = false;
                Ok(0)
            }
            Ok(read) => Ok(read),
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    self.readable = false;
                }
                Err(err)
            }
        }
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.write(buf) {
            Ok(written) => Ok(written),
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    self.writable = false;
                }
                Err(err)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn socket_id(&self) -> SocketId {
        self.id
    }

    fn poll_readable(&mut self) -> io::Result<bool> {
        if !self.readable {
            self.sweep()?;
        }

        Ok(self.open && self.readable)
    }

    fn poll_writable(&mut self) -> io::Result<bool> {
        if !self.writable {
            self.sweep()?;
        }

        Ok(self.open && self.writable)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}

// ----------------------------------------------------------------------------//

struct DuplexShared {
    a_to_b: BytesMut,
    b_to_a: BytesMut,
    a_open: bool,
    b_open: bool,
    a_writable: bool,
    b_writable: bool,
    a_write_limit: Option<usize>,
    b_write_limit: Option<usize>,
}

/// One end of an in memory duplex pair emulating a non blocking socket.
///
/// Used to simulate peer to peer exchanges without real sockets, the write
/// side of either end can be stalled to exercise rescheduling and timeout
/// paths.
pub struct DuplexTransport {
    shared: Rc<RefCell<DuplexShared>>,
    is_a: bool,
    id: SocketId,
    addr: SocketAddr,
}

/// Create a connected in memory transport pair.
pub fn duplex() -> (DuplexTransport, DuplexTransport) {
    let shared = Rc::new(RefCell::new(DuplexShared {
        a_to_b: BytesMut::new(),
        b_to_a: BytesMut::new(),
        a_open: true,
        b_open: true,
        a_writable: true,
        b_writable: true,
        a_write_limit: None,
        b_write_limit: None,
    }));

    let side_a = DuplexTransport {
        shared: shared.clone(),
        is_a: true,
        id: next_socket_id(),
        addr: "127.0.0.1:6881".parse().unwrap(),
    };
    let side_b = DuplexTransport {
        shared: shared,
        is_a: false,
        id: next_socket_id(),
        addr: "127.0.0.1:6882".parse().unwrap(),
    };

    (side_a, side_b)
}

impl DuplexTransport {
    /// Stall or resume writes on this end, simulating a full socket buffer.
    pub fn set_writable(&self, writable: bool) {
        let mut shared = self.shared.borrow_mut();

        if self.is_a {
            shared.a_writable = writable;
        } else {
            shared.b_writable = writable;
        }
    }

    /// Stall or resume writes on the other end of the pair.
    pub fn set_remote_writable(&self, writable: bool) {
        let mut shared = self.shared.borrow_mut();

        if self.is_a {
            shared.b_writable = writable;
        } else {
            shared.a_writable = writable;
        }
    }

    /// Cap the bytes the other end can push per write call, simulating a
    /// socket buffer that drains slowly.
    pub fn set_remote_write_limit(&self, limit: Option<usize>) {
        let mut shared = self.shared.borrow_mut();

        if self.is_a {
            shared.b_write_limit = limit;
        } else {
            shared.a_write_limit = limit;
        }
    }

    /// Close this end of the pair.
    pub fn close(&mut self) {
        let mut shared = self.shared.borrow_mut();

        if self.is_a {
            shared.a_open = false;
        } else {
            shared.b_open = false;
        }
    }

    fn would_block() -> io::Error {
        io::Error::new(io::ErrorKind::WouldBlock, "Duplex Transport Not Ready")
    }
}

impl Read for DuplexTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = self.shared.borrow_mut();

        let remote_open = if self.is_a {
            shared.b_open
        } else {
            shared.a_open
        };
        let incoming = if self.is_a {
            &mut shared.b_to_a
        } else {
            &mut shared.a_to_b
        };

        if incoming.is_empty() {
            if remote_open {
                Err(DuplexTransport::would_block())
            } else {
                Ok(0)
            }
        } else {
            let take = ::std::cmp::min(buf.len(), incoming.len());
            buf[..take].copy_from_slice(&incoming[..take]);
            incoming.advance(take);

            Ok(take)
        }
    }
}

impl Write for DuplexTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.borrow_mut();

        let writable = if self.is_a {
            shared.a_writable
        } else {
            shared.b_writable
        };
        let remote_open = if self.is_a {
            shared.b_open
        } else {
            shared.a_open
        };

        let write_limit = if self.is_a {
            shared.a_write_limit
        } else {
            shared.b_write_limit
        };

        if !writable {
            Err(DuplexTransport::would_block())
        } else if !remote_open {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "Duplex Remote End Closed"))
        } else {
            let take = match write_limit {
                Some(limit) => ::std::cmp::min(limit, buf.len()),
                None => buf.len(),
            };

            if take == 0 {
                return Err(DuplexTransport::would_block());
            }

            let outgoing = if self.is_a {
                &mut shared.a_to_b
            } else {
                &mut shared.b_to_a
            };
            outgoing.put_slice(&buf[..take]);

            Ok(take)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for DuplexTransport {
    fn socket_id(&self) -> SocketId {
        self.id
    }

    fn poll_readable(&mut self) -> io::Result<bool> {
        let shared = self.shared.borrow();

        let (has_bytes, remote_open) = if self.is_a {
            (!shared.b_to_a.is_empty(), shared.b_open)
        } else {
            (!shared.a_to_b.is_empty(), shared.a_open)
        };

        // A closed remote end is readable, the read observes eof.
        Ok(has_bytes || !remote_open)
    }

    fn poll_writable(&mut self) -> io::Result<bool> {
        let shared = self.shared.borrow();

        if self.is_a {
            Ok(shared.a_open && shared.a_writable)
        } else {
            Ok(shared.b_open && shared.b_writable)
        }
    }

    fn is_open(&self) -> bool {
        let shared = self.shared.borrow();

        if self.is_a {
            shared.a_open
        } else {
            shared.b_open
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
