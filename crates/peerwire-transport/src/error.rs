/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed by the remote end.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Accepting an incoming connection failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// Binding a listener failed.
    #[error("bind failed: {0}")]
    BindFailed(#[source] std::io::Error),

    /// Connecting to a remote listener failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// Shutting the socket down failed.
    #[error("shutdown failed: {0}")]
    ShutdownFailed(#[source] std::io::Error),

    /// The address could not be parsed or resolved.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// `receive_exact` asked for more bytes than are buffered.
    #[error("requested {requested} bytes but only {available} are available")]
    Insufficient {
        /// Bytes the caller asked for.
        requested: usize,
        /// Bytes that were ready.
        available: usize,
    },

    /// The socket was already shut down locally.
    #[error("socket shut down")]
    Shutdown,
}

impl TransportError {
    /// Returns `true` if the error means the remote end went away, as
    /// opposed to a local failure.
    pub fn is_remote_close(&self) -> bool {
        match self {
            Self::ConnectionClosed(_) => true,
            Self::SendFailed(e) | Self::ReceiveFailed(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
