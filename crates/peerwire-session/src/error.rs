//! Error types for the session layer.

use peerwire_protocol::ProtocolError;
use peerwire_transport::TransportError;

/// Errors that can occur on a [`Connection`](crate::Connection).
///
/// Every variant is fatal to the connection that raised it: by the time
/// the caller sees one, the connection has already been closed.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The socket failed or the remote end went away.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The peer sent bytes that are not a valid frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The outbound buffer grew past its limit because the peer is not
    /// reading.
    #[error("send buffer full: {buffered} bytes queued, limit {limit}")]
    SendBufferFull {
        /// Bytes that would be queued.
        buffered: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// The connection was already closed.
    #[error("connection closed")]
    Closed,
}
