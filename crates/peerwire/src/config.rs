//! Peer configuration.

use peerwire_protocol::LENGTH_PREFIX_LEN;
use peerwire_session::{ConnectionLimits, DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_SEND_BUFFER};
use peerwire_transport::TcpTransport;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Smallest frame limit that still admits a message header.
const MIN_FRAME_LEN: usize = 8;

/// Largest frame the 32-bit length prefix can announce.
const MAX_FRAME_LEN: usize = u32::MAX as usize;

/// Settings shared by [`Client`](crate::Client) and
/// [`Server`](crate::Server).
///
/// Missing fields take their defaults when deserializing, so a config
/// file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Host to bind (server) or connect to (client).
    pub address: String,

    /// Port to bind or connect to. A server bound to `0` gets a port
    /// from the OS; see [`Server::local_addr`](crate::Server::local_addr).
    pub port: u16,

    /// Disable Nagle's algorithm on TCP sockets.
    pub nodelay: bool,

    /// Largest frame accepted from the remote side.
    pub max_frame_len: usize,

    /// Largest unsent backlog per connection before it is dropped.
    pub max_send_buffer: usize,

    /// Frames read from one connection per tick, at most.
    pub max_frames_per_tick: usize,

    /// Server only: live connections allowed at once.
    pub max_connections: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 7777,
            nodelay: true,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_send_buffer: DEFAULT_MAX_SEND_BUFFER,
            max_frames_per_tick: 64,
            max_connections: 1024,
        }
    }
}

impl PeerConfig {
    /// Sets the host.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets `TCP_NODELAY`.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Sets the inbound frame limit.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Sets the outbound backlog limit.
    pub fn with_max_send_buffer(mut self, len: usize) -> Self {
        self.max_send_buffer = len;
        self
    }

    /// Sets the per-connection frame budget of one tick.
    pub fn with_max_frames_per_tick(mut self, frames: usize) -> Self {
        self.max_frames_per_tick = frames;
        self
    }

    /// Sets the server's connection limit.
    pub fn with_max_connections(mut self, connections: usize) -> Self {
        self.max_connections = connections;
        self
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }

    /// The per-connection size limits.
    pub fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_frame_len: self.max_frame_len,
            max_send_buffer: self.max_send_buffer,
        }
    }

    /// Unread bytes a socket may stage: one maximal frame and its
    /// length prefix.
    pub fn read_limit(&self) -> usize {
        self.max_frame_len.saturating_add(LENGTH_PREFIX_LEN)
    }

    /// A TCP transport honouring `nodelay` and [`read_limit`](Self::read_limit).
    pub fn tcp_transport(&self) -> TcpTransport {
        TcpTransport::new(self.nodelay).with_read_limit(self.read_limit())
    }

    /// Returns a copy with out-of-range values clamped:
    ///
    /// - `max_frame_len` into `8..=u32::MAX`.
    /// - `max_send_buffer` at least one maximal frame plus its prefix.
    /// - `max_frames_per_tick` and `max_connections` at least `1`.
    pub fn validated(mut self) -> Self {
        if self.max_frame_len < MIN_FRAME_LEN || self.max_frame_len > MAX_FRAME_LEN {
            let clamped = self.max_frame_len.clamp(MIN_FRAME_LEN, MAX_FRAME_LEN);
            warn!(
                requested = self.max_frame_len,
                clamped, "max_frame_len out of range, clamping"
            );
            self.max_frame_len = clamped;
        }

        let floor = self.read_limit();
        if self.max_send_buffer < floor {
            warn!(
                requested = self.max_send_buffer,
                clamped = floor,
                "max_send_buffer cannot hold one frame, raising"
            );
            self.max_send_buffer = floor;
        }

        if self.max_frames_per_tick == 0 {
            warn!("max_frames_per_tick is 0, using 1");
            self.max_frames_per_tick = 1;
        }
        if self.max_connections == 0 {
            warn!("max_connections is 0, using 1");
            self.max_connections = 1;
        }
        self
    }
}
