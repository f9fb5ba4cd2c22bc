//! TCP transport over non-blocking `std::net` sockets.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener as StdTcpListener, TcpStream};

use bytes::{Buf, BytesMut};

use crate::{Listener, StreamSocket, Transport, TransportError};

/// Size of the scratch buffer used for each `read` syscall.
const READ_CHUNK: usize = 16 * 1024;

/// Inbound bytes staged per socket unless configured otherwise: one
/// 1 MiB frame plus its length prefix.
pub const DEFAULT_READ_LIMIT: usize = 1024 * 1024 + 4;

/// A [`Transport`] producing non-blocking TCP sockets.
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    nodelay: bool,
    read_limit: usize,
}

impl TcpTransport {
    /// Creates a TCP transport. `nodelay` disables Nagle's algorithm on
    /// every socket it produces.
    pub fn new(nodelay: bool) -> Self {
        Self {
            nodelay,
            read_limit: DEFAULT_READ_LIMIT,
        }
    }

    /// Caps how many unread bytes each socket pulls out of the kernel.
    ///
    /// Once a socket holds `limit` unread bytes it stops reading, so the
    /// kernel window fills and the sender is throttled. The limit must
    /// cover the largest read a caller will wait for; a value of `0` is
    /// raised to `1`.
    pub fn with_read_limit(mut self, limit: usize) -> Self {
        self.read_limit = limit.max(1);
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Transport for TcpTransport {
    type Socket = TcpSocket;
    type Listener = TcpListener;

    fn bind(&self, addr: &str) -> Result<Self::Listener, TransportError> {
        let listener =
            StdTcpListener::bind(addr).map_err(TransportError::BindFailed)?;
        listener
            .set_nonblocking(true)
            .map_err(TransportError::BindFailed)?;
        tracing::info!(addr, "TCP transport listening");
        Ok(TcpListener {
            listener,
            nodelay: self.nodelay,
            read_limit: self.read_limit,
        })
    }

    fn connect(&self, addr: &str) -> Result<Self::Socket, TransportError> {
        let stream =
            TcpStream::connect(addr).map_err(TransportError::ConnectFailed)?;
        tracing::debug!(addr, "TCP stream connected");
        TcpSocket::from_stream(stream, self.nodelay)
            .map(|socket| socket.with_read_limit(self.read_limit))
    }
}

/// A non-blocking TCP listener.
pub struct TcpListener {
    listener: StdTcpListener,
    nodelay: bool,
    read_limit: usize,
}

impl Listener for TcpListener {
    type Socket = TcpSocket;

    fn accept(
        &mut self,
    ) -> Result<Option<(Self::Socket, SocketAddr)>, TransportError> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let socket = TcpSocket::from_stream(stream, self.nodelay)?
                    .with_read_limit(self.read_limit);
                Ok(Some((socket, addr)))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::AcceptFailed(e)),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(TransportError::BindFailed)
    }
}

/// A non-blocking TCP stream with an inbound staging buffer.
///
/// `available` moves bytes from the kernel into `inbound` until the
/// kernel has nothing more or `read_limit` unread bytes are staged. The
/// count it reports is exact and `receive_exact` never touches the
/// socket. Bytes past the limit stay in the kernel, which applies TCP
/// flow control to the sender.
pub struct TcpSocket {
    stream: TcpStream,
    inbound: BytesMut,
    read_limit: usize,
    peer: Option<SocketAddr>,
    eof: bool,
    shut: bool,
}

impl TcpSocket {
    /// Wraps a connected stream, switching it to non-blocking mode.
    pub fn from_stream(
        stream: TcpStream,
        nodelay: bool,
    ) -> Result<Self, TransportError> {
        stream
            .set_nonblocking(true)
            .map_err(TransportError::ConnectFailed)?;
        stream
            .set_nodelay(nodelay)
            .map_err(TransportError::ConnectFailed)?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            read_limit: DEFAULT_READ_LIMIT,
            peer,
            eof: false,
            shut: false,
        })
    }

    /// Sets how many unread bytes this socket stages at most.
    pub fn with_read_limit(mut self, limit: usize) -> Self {
        self.read_limit = limit.max(1);
        self
    }

    /// Reads what the kernel has ready into `inbound`, up to the read
    /// limit.
    fn fill(&mut self) -> Result<(), TransportError> {
        if self.eof {
            return Ok(());
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let room = self.read_limit.saturating_sub(self.inbound.len());
            if room == 0 {
                return Ok(());
            }
            let want = room.min(READ_CHUNK);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                }
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::ReceiveFailed(e)),
            }
        }
    }
}

impl StreamSocket for TcpSocket {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if self.shut {
            return Err(TransportError::Shutdown);
        }

        loop {
            match self.stream.write(data) {
                Ok(0) if !data.is_empty() => {
                    return Err(TransportError::SendFailed(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    )));
                }
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(0);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::SendFailed(e)),
            }
        }
    }

    fn available(&mut self) -> Result<usize, TransportError> {
        if self.shut {
            return Err(TransportError::Shutdown);
        }
        self.fill()?;
        Ok(self.inbound.len())
    }

    fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        if self.inbound.len() < buf.len() {
            return Err(TransportError::Insufficient {
                requested: buf.len(),
                available: self.inbound.len(),
            });
        }
        self.inbound.copy_to_slice(buf);
        Ok(())
    }

    fn at_eof(&self) -> bool {
        self.eof
    }

    fn shutdown(&mut self) -> Result<(), TransportError> {
        if self.shut {
            return Ok(());
        }
        self.shut = true;
        self.inbound.clear();

        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // The peer beat us to it.
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(TransportError::ShutdownFailed(e)),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// Accepts one connection, retrying until the handshake lands.
    fn accept_one(listener: &mut TcpListener) -> TcpSocket {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some((socket, _)) = listener.accept().expect("accept") {
                return socket;
            }
            assert!(Instant::now() < deadline, "no connection accepted");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Polls `available` until at least `n` bytes arrived.
    fn wait_for(socket: &mut TcpSocket, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while socket.available().expect("available") < n {
            assert!(Instant::now() < deadline, "bytes never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_accept_without_pending_connection_returns_none() {
        let mut listener =
            TcpTransport::default().bind("127.0.0.1:0").expect("bind");
        assert!(listener.accept().expect("accept").is_none());
    }

    #[test]
    fn test_send_and_receive_exact_round_trip() {
        let transport = TcpTransport::default();
        let mut listener = transport.bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        let mut client = transport.connect(&addr).expect("connect");
        let mut server = accept_one(&mut listener);

        assert_eq!(client.send(b"hello").expect("send"), 5);
        wait_for(&mut server, 5);

        let mut buf = [0u8; 5];
        server.receive_exact(&mut buf).expect("receive");
        assert_eq!(&buf, b"hello");
        assert_eq!(server.available().expect("available"), 0);
    }

    #[test]
    fn test_receive_exact_more_than_available_errors() {
        let transport = TcpTransport::default();
        let mut listener = transport.bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let _client = transport.connect(&addr).expect("connect");
        let mut server = accept_one(&mut listener);

        let mut buf = [0u8; 4];
        let result = server.receive_exact(&mut buf);
        assert!(matches!(
            result,
            Err(TransportError::Insufficient {
                requested: 4,
                available: 0
            })
        ));
    }

    #[test]
    fn test_peer_shutdown_sets_eof() {
        let transport = TcpTransport::default();
        let mut listener = transport.bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let mut client = transport.connect(&addr).expect("connect");
        let mut server = accept_one(&mut listener);

        client.shutdown().expect("shutdown");
        client.shutdown().expect("second shutdown is a no-op");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !server.at_eof() {
            server.available().expect("available");
            assert!(Instant::now() < deadline, "eof never observed");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_send_after_shutdown_errors() {
        let transport = TcpTransport::default();
        let mut listener = transport.bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let mut client = transport.connect(&addr).expect("connect");

        client.shutdown().expect("shutdown");
        assert!(matches!(client.send(b"x"), Err(TransportError::Shutdown)));
    }

    #[test]
    fn test_available_stops_at_read_limit_while_peer_keeps_writing() {
        const LIMIT: usize = 64 * 1024;
        let transport = TcpTransport::default().with_read_limit(LIMIT);
        let mut listener = transport.bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        let writer = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).expect("connect");
            let block = vec![7u8; 64 * 1024];
            // Fails once the reading side goes away.
            for _ in 0..256 {
                if stream.write_all(&block).is_err() {
                    break;
                }
            }
        });
        let mut server = accept_one(&mut listener);

        wait_for(&mut server, LIMIT);
        for _ in 0..20 {
            assert_eq!(server.available().expect("available"), LIMIT);
            std::thread::sleep(Duration::from_millis(5));
        }

        // Consuming makes room for more.
        let mut buf = vec![0u8; LIMIT / 2];
        server.receive_exact(&mut buf).expect("receive");
        wait_for(&mut server, LIMIT);
        assert_eq!(server.available().expect("available"), LIMIT);

        drop(server);
        writer.join().expect("writer thread");
    }

    #[test]
    fn test_with_read_limit_zero_is_raised_to_one() {
        let transport = TcpTransport::default().with_read_limit(0);
        assert_eq!(transport.read_limit, 1);
    }

    #[test]
    fn test_connect_to_closed_port_fails() {
        // Bind then drop to find a port nobody listens on.
        let addr = {
            let listener =
                TcpTransport::default().bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").to_string()
        };
        let result = TcpTransport::default().connect(&addr);
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }
}
