//! A framed connection over one stream socket.
//!
//! Inbound bytes go through a two-state reassembly machine:
//!
//! ```text
//!            4 bytes available                 n bytes available
//! AwaitingLength ───────────────→ AwaitingBody(n) ───────────────→ AwaitingLength
//!                                                 (one Envelope out)
//! ```
//!
//! Neither state blocks. With too few bytes buffered, `receive` returns
//! `Ok(None)` and the next call resumes where this one stopped.
//!
//! Outbound frames are appended to a buffer and flushed as far as the
//! socket accepts. Whatever did not fit stays queued for the next
//! `send` or `flush`.

use std::fmt;
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use peerwire_protocol::{Envelope, Kind, LENGTH_PREFIX_LEN, ProtocolError};
use peerwire_transport::{ConnectionId, StreamSocket, TransportError};

use crate::SessionError;

/// Default ceiling for a single inbound frame (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Default ceiling for queued outbound bytes (4 MiB).
pub const DEFAULT_MAX_SEND_BUFFER: usize = 4 * 1024 * 1024;

/// Smallest legal `total_len`: a frame must at least carry its kind.
const MIN_FRAME_LEN: usize = 4;

/// Called once, with the connection's id, when it closes.
pub type ClosedCallback = Box<dyn FnOnce(ConnectionId)>;

/// Size limits applied to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Largest `total_len` accepted from the peer.
    pub max_frame_len: usize,
    /// Largest unsent backlog before the peer counts as dead.
    pub max_send_buffer: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_send_buffer: DEFAULT_MAX_SEND_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    AwaitingLength,
    AwaitingBody(usize),
}

/// One live link to a remote peer.
///
/// Every error returned from [`send`](Self::send), [`flush`](Self::flush)
/// or [`receive`](Self::receive) is fatal: the connection closes itself
/// before returning it, and the closed callback has already run.
pub struct Connection<S> {
    id: ConnectionId,
    socket: S,
    state: ReadState,
    outbound: BytesMut,
    limits: ConnectionLimits,
    open: bool,
    on_closed: Option<ClosedCallback>,
}

impl<S: StreamSocket> Connection<S> {
    /// Wraps a connected socket.
    pub fn new(id: ConnectionId, socket: S, limits: ConnectionLimits) -> Self {
        Self {
            id,
            socket,
            state: ReadState::AwaitingLength,
            outbound: BytesMut::new(),
            limits,
            open: true,
            on_closed: None,
        }
    }

    /// The id this connection was created with.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// `false` once [`close`](Self::close) ran, for whatever reason.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// The remote address, if the transport reports one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr()
    }

    /// Outbound bytes still waiting for the socket.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Installs the callback fired when the connection closes. Replaces
    /// any earlier callback that has not fired yet.
    pub fn set_on_closed(&mut self, callback: impl FnOnce(ConnectionId) + 'static) {
        self.on_closed = Some(Box::new(callback));
    }

    // -- Sending ----------------------------------------------------------

    /// Frames `envelope` and sends it.
    pub fn send(&mut self, envelope: &Envelope) -> Result<(), SessionError> {
        self.ensure_open()?;
        let mut wire = BytesMut::new();
        envelope.frame_into(&mut wire)?;
        self.send_framed(&wire)
    }

    /// Sends bytes that already hold one or more complete frames.
    ///
    /// Used to broadcast a message that was serialized once.
    pub fn send_framed(&mut self, wire: &[u8]) -> Result<(), SessionError> {
        self.ensure_open()?;

        let buffered = self.outbound.len() + wire.len();
        if buffered > self.limits.max_send_buffer {
            tracing::error!(
                connection_id = %self.id,
                buffered,
                limit = self.limits.max_send_buffer,
                "send buffer full, peer is not reading"
            );
            self.shut(false);
            return Err(SessionError::SendBufferFull {
                buffered,
                limit: self.limits.max_send_buffer,
            });
        }

        self.outbound.extend_from_slice(wire);
        self.flush()
    }

    /// Pushes queued outbound bytes into the socket until it stops
    /// accepting them.
    pub fn flush(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if let Err(e) = self.drain_outbound() {
            tracing::error!(connection_id = %self.id, error = %e, "send failed");
            self.shut(false);
            return Err(e.into());
        }
        Ok(())
    }

    fn drain_outbound(&mut self) -> Result<(), TransportError> {
        while !self.outbound.is_empty() {
            let n = self.socket.send(&self.outbound)?;
            if n == 0 {
                break;
            }
            self.outbound.advance(n);
        }
        Ok(())
    }

    // -- Receiving --------------------------------------------------------

    /// Returns the next complete application envelope, or `Ok(None)` if
    /// no full frame has arrived yet.
    ///
    /// A `Disconnect` envelope from the peer closes this side (without
    /// answering with another `Disconnect`) and yields `Ok(None)`.
    /// Calling `receive` on a closed connection also yields `Ok(None)`.
    pub fn receive(&mut self) -> Result<Option<Envelope>, SessionError> {
        if !self.open {
            return Ok(None);
        }

        match self.next_frame() {
            Ok(None) => Ok(None),
            Ok(Some(envelope)) if envelope.kind() == Kind::Disconnect => {
                tracing::debug!(connection_id = %self.id, "disconnect notice received");
                self.shut(false);
                Ok(None)
            }
            Ok(Some(envelope)) => {
                tracing::trace!(
                    connection_id = %self.id,
                    message_id = ?envelope.message_id(),
                    len = envelope.to_bytes().len(),
                    "frame received"
                );
                Ok(Some(envelope))
            }
            Err(e) => {
                match &e {
                    SessionError::Transport(t) if t.is_remote_close() => {
                        tracing::debug!(connection_id = %self.id, error = %e, "peer went away");
                    }
                    _ => {
                        tracing::error!(connection_id = %self.id, error = %e, "receive failed");
                    }
                }
                // A malformed frame leaves the socket usable, so the peer
                // still gets told why we hung up.
                let courtesy = matches!(e, SessionError::Protocol(_));
                self.shut(courtesy);
                Err(e)
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<Envelope>, SessionError> {
        if self.state == ReadState::AwaitingLength {
            if !self.has_bytes(LENGTH_PREFIX_LEN)? {
                return Ok(None);
            }
            let mut prefix = [0u8; LENGTH_PREFIX_LEN];
            self.socket.receive_exact(&mut prefix)?;
            let len = (&prefix[..]).get_u32_le() as usize;

            if len < MIN_FRAME_LEN {
                return Err(ProtocolError::Framing(format!(
                    "frame length {len} cannot hold a header"
                ))
                .into());
            }
            if len > self.limits.max_frame_len {
                return Err(ProtocolError::FrameTooLarge {
                    len,
                    max: self.limits.max_frame_len,
                }
                .into());
            }
            self.state = ReadState::AwaitingBody(len);
        }

        let ReadState::AwaitingBody(len) = self.state else {
            return Ok(None);
        };
        if !self.has_bytes(len)? {
            return Ok(None);
        }

        let mut payload = BytesMut::zeroed(len);
        self.socket.receive_exact(&mut payload)?;
        self.state = ReadState::AwaitingLength;
        Ok(Some(Envelope::decode(payload)?))
    }

    /// `Ok(true)` if `needed` bytes are buffered. Running short after the
    /// peer finished sending means the stream ended mid-frame or between
    /// frames without a `Disconnect`; both count as a closed connection.
    fn has_bytes(&mut self, needed: usize) -> Result<bool, SessionError> {
        let available = self.socket.available()?;
        if available >= needed {
            return Ok(true);
        }
        if self.socket.at_eof() {
            let reason = if available == 0 && self.state == ReadState::AwaitingLength {
                "stream ended".to_string()
            } else {
                format!("stream ended {available} bytes into a {needed}-byte read")
            };
            return Err(TransportError::ConnectionClosed(reason).into());
        }
        Ok(false)
    }

    // -- Closing ----------------------------------------------------------

    /// Sends a `Disconnect` notice, shuts the socket down and fires the
    /// closed callback. Later calls do nothing.
    pub fn close(&mut self) {
        self.shut(true);
    }

    fn shut(&mut self, courtesy: bool) {
        if !self.open {
            return;
        }
        // Flip first so anything re-entering from below sees us closed.
        self.open = false;

        if courtesy {
            let sent = Envelope::disconnect()
                .frame_into(&mut self.outbound)
                .map_err(SessionError::from)
                .and_then(|()| self.drain_outbound().map_err(SessionError::from));
            if let Err(e) = sent {
                tracing::debug!(connection_id = %self.id, error = %e, "disconnect notice not delivered");
            }
        }

        if let Err(e) = self.socket.shutdown() {
            tracing::debug!(connection_id = %self.id, error = %e, "socket shutdown failed");
        }
        self.outbound.clear();
        self.state = ReadState::AwaitingLength;
        tracing::info!(connection_id = %self.id, "connection closed");

        if let Some(callback) = self.on_closed.take() {
            callback(self.id);
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.open {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("open", &self.open)
            .field("state", &self.state)
            .field("pending_outbound", &self.outbound.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::{IpAddr, Ipv4Addr};
    use std::rc::Rc;

    use peerwire_protocol::MessageId;
    use peerwire_transport::MemorySocket;

    fn sockets() -> (MemorySocket, MemorySocket) {
        let a = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        let b = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2);
        MemorySocket::pair(a, b)
    }

    fn pair() -> (Connection<MemorySocket>, Connection<MemorySocket>) {
        let (a, b) = sockets();
        (
            Connection::new(ConnectionId::new(1), a, ConnectionLimits::default()),
            Connection::new(ConnectionId::SERVER, b, ConnectionLimits::default()),
        )
    }

    fn int_envelope(id: u16, value: i32) -> Envelope {
        let mut env = Envelope::message(MessageId(id));
        env.write_int(value);
        env
    }

    #[test]
    fn test_send_then_receive_delivers_envelope() {
        let (mut a, mut b) = pair();
        a.send(&int_envelope(3, 42)).unwrap();

        let mut env = b.receive().unwrap().expect("frame");
        assert_eq!(env.message_id(), Some(MessageId(3)));
        assert_eq!(env.read_int().unwrap(), 42);
        assert!(b.receive().unwrap().is_none());
    }

    #[test]
    fn test_receive_with_nothing_buffered_returns_none() {
        let (_a, mut b) = pair();
        assert!(b.receive().unwrap().is_none());
        assert!(b.is_open());
    }

    #[test]
    fn test_receive_preserves_frame_order() {
        let (mut a, mut b) = pair();
        for v in 0..5 {
            a.send(&int_envelope(1, v)).unwrap();
        }
        for v in 0..5 {
            let mut env = b.receive().unwrap().expect("frame");
            assert_eq!(env.read_int().unwrap(), v);
        }
    }

    #[test]
    fn test_close_is_idempotent_and_fires_callback_once() {
        let (mut a, _b) = pair();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&fired);
        a.set_on_closed(move |id| sink.borrow_mut().push(id));

        a.close();
        a.close();

        assert!(!a.is_open());
        assert_eq!(*fired.borrow(), vec![ConnectionId::new(1)]);
    }

    #[test]
    fn test_close_sends_disconnect_notice() {
        let (mut a, mut b) = pair();
        let fired = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&fired);
        b.set_on_closed(move |_| *sink.borrow_mut() += 1);

        a.close();

        assert!(b.receive().unwrap().is_none());
        assert!(!b.is_open());
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn test_send_after_close_is_closed_error() {
        let (mut a, _b) = pair();
        a.close();
        assert!(matches!(
            a.send(&int_envelope(1, 1)),
            Err(SessionError::Closed)
        ));
    }

    #[test]
    fn test_receive_after_abrupt_drop_is_transport_error() {
        let (mut a, b) = pair();
        drop(b);
        let result = a.receive();
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::ConnectionClosed(_)))
        ));
        assert!(!a.is_open());
    }

    #[test]
    fn test_oversized_length_prefix_is_rejected_and_closes() {
        let (mut raw, b) = sockets();
        let limits = ConnectionLimits {
            max_frame_len: 16,
            ..ConnectionLimits::default()
        };
        let mut conn = Connection::new(ConnectionId::new(5), b, limits);

        raw.send(&17u32.to_le_bytes()).unwrap();
        assert!(matches!(
            conn.receive(),
            Err(SessionError::Protocol(ProtocolError::FrameTooLarge {
                len: 17,
                max: 16
            }))
        ));
        assert!(!conn.is_open());
    }

    #[test]
    fn test_length_below_header_is_framing_error() {
        let (mut raw, b) = sockets();
        let mut conn = Connection::new(ConnectionId::new(5), b, ConnectionLimits::default());

        raw.send(&2u32.to_le_bytes()).unwrap();
        assert!(matches!(
            conn.receive(),
            Err(SessionError::Protocol(ProtocolError::Framing(_)))
        ));
    }

    #[test]
    fn test_partial_writes_are_completed_by_flush() {
        let (mut a_sock, b_sock) = sockets();
        a_sock.set_send_limit(Some(3));
        let mut a = Connection::new(ConnectionId::new(1), a_sock, ConnectionLimits::default());
        let mut b = Connection::new(ConnectionId::SERVER, b_sock, ConnectionLimits::default());

        a.send(&int_envelope(9, 77)).unwrap();
        // The capped socket took three bytes per call until drained.
        assert_eq!(a.pending_outbound(), 0);

        let mut env = b.receive().unwrap().expect("frame");
        assert_eq!(env.read_int().unwrap(), 77);
    }

    #[test]
    fn test_send_buffer_limit_closes_connection() {
        let (a_sock, _b_sock) = sockets();
        let limits = ConnectionLimits {
            max_send_buffer: 8,
            ..ConnectionLimits::default()
        };
        let mut a = Connection::new(ConnectionId::new(1), a_sock, limits);

        let mut big = Envelope::message(MessageId(1));
        big.write_string("far more than eight bytes").unwrap();
        assert!(matches!(
            a.send(&big),
            Err(SessionError::SendBufferFull { limit: 8, .. })
        ));
        assert!(!a.is_open());
    }

    #[test]
    fn test_send_framed_writes_bytes_verbatim() {
        let (mut a, mut b) = pair();
        let wire = int_envelope(2, 5).frame().unwrap();
        a.send_framed(&wire).unwrap();
        a.send_framed(&wire).unwrap();

        assert!(b.receive().unwrap().is_some());
        assert!(b.receive().unwrap().is_some());
        assert!(b.receive().unwrap().is_none());
    }
}
