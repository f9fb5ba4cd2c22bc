//! In-process transport built from shared byte pipes.
//!
//! Sockets created here behave like non-blocking TCP streams: writes are
//! immediately visible to the other end, shutdown is observed as end of
//! stream, and dropping a socket closes it. Everything is `Rc`-based, so
//! a network lives on one thread, which is also the threading model of
//! the peers that use it.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use crate::{Listener, StreamSocket, Transport, TransportError};

/// First port handed out for `:0` binds and client ends.
const EPHEMERAL_PORT_START: u16 = 49152;

#[derive(Default)]
struct Pipe {
    data: VecDeque<u8>,
    closed: bool,
}

#[derive(Default)]
struct Backlog {
    pending: VecDeque<(MemorySocket, SocketAddr)>,
}

struct Network {
    listeners: HashMap<SocketAddr, Rc<RefCell<Backlog>>>,
    next_port: u16,
}

impl Network {
    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(EPHEMERAL_PORT_START);
        port
    }
}

/// A [`Transport`] whose sockets are in-memory pipes.
///
/// Clones share the same network, so a server bound through one clone
/// is reachable through every other.
#[derive(Clone)]
pub struct MemoryTransport {
    network: Rc<RefCell<Network>>,
}

impl MemoryTransport {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self {
            network: Rc::new(RefCell::new(Network {
                listeners: HashMap::new(),
                next_port: EPHEMERAL_PORT_START,
            })),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, TransportError> {
    addr.parse()
        .map_err(|_| TransportError::InvalidAddress(addr.to_string()))
}

impl Transport for MemoryTransport {
    type Socket = MemorySocket;
    type Listener = MemoryListener;

    fn bind(&self, addr: &str) -> Result<Self::Listener, TransportError> {
        let mut addr = parse_addr(addr)?;
        let mut network = self.network.borrow_mut();

        if addr.port() == 0 {
            addr.set_port(network.ephemeral_port());
        }
        if network.listeners.contains_key(&addr) {
            return Err(TransportError::BindFailed(io::Error::from(
                io::ErrorKind::AddrInUse,
            )));
        }

        let backlog = Rc::new(RefCell::new(Backlog::default()));
        network.listeners.insert(addr, Rc::clone(&backlog));
        tracing::debug!(%addr, "memory transport listening");

        Ok(MemoryListener {
            addr,
            backlog,
            network: Rc::clone(&self.network),
        })
    }

    fn connect(&self, addr: &str) -> Result<Self::Socket, TransportError> {
        let addr = parse_addr(addr)?;
        let mut network = self.network.borrow_mut();

        let backlog = network.listeners.get(&addr).cloned().ok_or_else(|| {
            TransportError::ConnectFailed(io::Error::from(
                io::ErrorKind::ConnectionRefused,
            ))
        })?;

        let client_addr = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            network.ephemeral_port(),
        );
        let (client, server) = MemorySocket::pair(client_addr, addr);
        backlog.borrow_mut().pending.push_back((server, client_addr));

        Ok(client)
    }
}

/// A listener on a [`MemoryTransport`] network. Dropping it unbinds the
/// address and refuses every connection still waiting in its backlog.
pub struct MemoryListener {
    addr: SocketAddr,
    backlog: Rc<RefCell<Backlog>>,
    network: Rc<RefCell<Network>>,
}

impl Listener for MemoryListener {
    type Socket = MemorySocket;

    fn accept(
        &mut self,
    ) -> Result<Option<(Self::Socket, SocketAddr)>, TransportError> {
        Ok(self.backlog.borrow_mut().pending.pop_front())
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.addr)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.borrow_mut().listeners.remove(&self.addr);
        // Dropping the pending sockets closes them, so waiting clients
        // see end of stream.
        self.backlog.borrow_mut().pending.clear();
    }
}

/// One end of an in-memory byte stream.
pub struct MemorySocket {
    inbound: Rc<RefCell<Pipe>>,
    outbound: Rc<RefCell<Pipe>>,
    peer: SocketAddr,
    send_limit: Option<usize>,
    shut: bool,
}

impl MemorySocket {
    /// Creates two connected sockets. The first one's peer address is
    /// `b`, the second one's is `a`.
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let a_to_b = Rc::new(RefCell::new(Pipe::default()));
        let b_to_a = Rc::new(RefCell::new(Pipe::default()));

        let first = Self {
            inbound: Rc::clone(&b_to_a),
            outbound: Rc::clone(&a_to_b),
            peer: b,
            send_limit: None,
            shut: false,
        };
        let second = Self {
            inbound: a_to_b,
            outbound: b_to_a,
            peer: a,
            send_limit: None,
            shut: false,
        };
        (first, second)
    }

    /// Caps how many bytes a single `send` accepts, to exercise
    /// partial-write handling. `None` removes the cap.
    pub fn set_send_limit(&mut self, limit: Option<usize>) {
        self.send_limit = limit;
    }

    fn close_pipes(&self) {
        self.inbound.borrow_mut().closed = true;
        self.outbound.borrow_mut().closed = true;
    }
}

impl StreamSocket for MemorySocket {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.shut {
            return Err(TransportError::Shutdown);
        }

        let mut pipe = self.outbound.borrow_mut();
        if pipe.closed {
            return Err(TransportError::SendFailed(io::Error::from(
                io::ErrorKind::BrokenPipe,
            )));
        }

        let n = self.send_limit.map_or(data.len(), |limit| limit.min(data.len()));
        pipe.data.extend(&data[..n]);
        Ok(n)
    }

    fn available(&mut self) -> Result<usize, TransportError> {
        if self.shut {
            return Err(TransportError::Shutdown);
        }
        Ok(self.inbound.borrow().data.len())
    }

    fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut pipe = self.inbound.borrow_mut();
        if pipe.data.len() < buf.len() {
            return Err(TransportError::Insufficient {
                requested: buf.len(),
                available: pipe.data.len(),
            });
        }
        let len = buf.len();
        for (slot, byte) in buf.iter_mut().zip(pipe.data.drain(..len)) {
            *slot = byte;
        }
        Ok(())
    }

    fn at_eof(&self) -> bool {
        self.inbound.borrow().closed
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        if !self.shut {
            self.shut = true;
            self.close_pipes();
        }
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.close_pipes();
    }
}
