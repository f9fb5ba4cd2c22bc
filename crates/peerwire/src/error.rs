//! Unified error type for peerwire.

use peerwire_broker::BrokerError;
use peerwire_protocol::ProtocolError;
use peerwire_session::SessionError;
use peerwire_transport::TransportError;

/// Top-level error that wraps every layer's error.
///
/// Only configuration problems and failures to bind or connect reach
/// the caller. Failures on an established connection close it and are
/// reported through the disconnect callbacks instead.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Binding, connecting or accepting failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An envelope could not be built or parsed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A connection failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A message type is unregistered, or could not be encoded.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
