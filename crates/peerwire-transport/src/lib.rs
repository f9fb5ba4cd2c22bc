//! Transport abstraction layer for peerwire.
//!
//! Provides the [`StreamSocket`], [`Listener`] and [`Transport`] traits
//! that the connection layer is written against, plus two
//! implementations:
//!
//! - [`TcpTransport`]: non-blocking `std::net` TCP sockets.
//! - `MemoryTransport`: an in-process network of byte pipes, used by
//!   tests and simulations (behind the `memory` feature).
//!
//! Every operation here is non-blocking except [`Transport::connect`],
//! which completes the TCP handshake before switching the socket to
//! non-blocking mode.
//!
//! # Feature Flags
//!
//! - `memory`: in-memory transport for deterministic tests

mod error;
#[cfg(feature = "memory")]
mod memory;
mod tcp;

pub use error::TransportError;
#[cfg(feature = "memory")]
pub use memory::{MemoryListener, MemorySocket, MemoryTransport};
pub use tcp::{DEFAULT_READ_LIMIT, TcpListener, TcpSocket, TcpTransport};

use std::fmt;
use std::net::SocketAddr;

/// Identifier for a connection as seen by its owning peer.
///
/// Servers hand out small non-negative ids and reuse them after a
/// connection closes. A client has exactly one connection, which it
/// names [`ConnectionId::SERVER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(i32);

impl ConnectionId {
    /// The id a client uses for its single connection to the server.
    pub const SERVER: ConnectionId = ConnectionId(-1);

    /// Creates a new `ConnectionId` from a raw `i32`.
    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// Returns the underlying `i32` value.
    pub fn into_inner(self) -> i32 {
        self.0
    }

    /// Returns `true` for the client-side server sentinel.
    pub fn is_server(self) -> bool {
        self == Self::SERVER
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_server() {
            write!(f, "conn-server")
        } else {
            write!(f, "conn-{}", self.0)
        }
    }
}

/// One end of a byte stream.
///
/// Implementations never block: `send` writes what fits, `available`
/// pulls whatever has arrived, and `receive_exact` only hands out bytes
/// that `available` already reported.
pub trait StreamSocket {
    /// Writes as much of `data` as the socket accepts right now.
    ///
    /// Returns the number of bytes written; `0` means the socket cannot
    /// take more without blocking and the caller should retry later.
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Returns the number of inbound bytes readable without blocking.
    fn available(&mut self) -> Result<usize, TransportError>;

    /// Fills `buf` entirely from already-available bytes.
    ///
    /// # Errors
    /// Returns [`TransportError::Insufficient`] if fewer than
    /// `buf.len()` bytes are buffered.
    fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Returns `true` once the remote end has finished sending. Bytes
    /// buffered before the end of stream are still readable.
    fn at_eof(&self) -> bool;

    /// Shuts the socket down in both directions. Idempotent.
    fn shutdown(&mut self) -> Result<(), TransportError>;

    /// The remote address, when the transport knows it.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Accepts incoming stream sockets without blocking.
pub trait Listener {
    /// The socket type produced by this listener.
    type Socket: StreamSocket;

    /// Accepts one pending connection, or returns `Ok(None)` when none
    /// is ready.
    fn accept(&mut self) -> Result<Option<(Self::Socket, SocketAddr)>, TransportError>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

/// Creates listeners (server role) and outgoing sockets (client role).
pub trait Transport {
    /// The socket type carried by this transport.
    type Socket: StreamSocket;
    /// The listener type produced by [`bind`](Self::bind).
    type Listener: Listener<Socket = Self::Socket>;

    /// Binds a listener to `addr` (`"host:port"`).
    fn bind(&self, addr: &str) -> Result<Self::Listener, TransportError>;

    /// Connects to the listener at `addr`. Returns once the stream is
    /// usable; the returned socket is non-blocking.
    fn connect(&self, addr: &str) -> Result<Self::Socket, TransportError>;
}
