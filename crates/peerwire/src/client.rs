//! The client role: one connection to one server.

use std::net::SocketAddr;

use peerwire_broker::{MessageRegistry, RegistrationTable};
use peerwire_protocol::Message;
use peerwire_session::Connection;
use peerwire_transport::{ConnectionId, TcpTransport, Transport};
use tracing::{debug, info, warn};

use crate::peer::{pump, send_pooled};
use crate::{Peer, PeerConfig, PeerError};

type Notify = Box<dyn FnMut()>;

/// A poll-driven client.
///
/// ```text
/// Disconnected ──connect()──→ Connected ──disconnect() / peer closed──→ Disconnected
/// ```
///
/// Handlers subscribed on a client receive [`ConnectionId::SERVER`] as
/// the sender id.
pub struct Client<T: Transport = TcpTransport> {
    transport: T,
    config: PeerConfig,
    registry: MessageRegistry,
    connection: Option<Connection<T::Socket>>,
    on_connected: Vec<Notify>,
    on_disconnected: Vec<Notify>,
}

impl Client<TcpTransport> {
    /// Creates a TCP client. Nothing happens on the network until
    /// [`connect`](Self::connect).
    pub fn new(table: RegistrationTable, config: PeerConfig) -> Self {
        let config = config.validated();
        let transport = config.tcp_transport();
        Self::with_transport(table, config, transport)
    }
}

impl<T: Transport> Client<T> {
    /// Creates a client over any transport.
    pub fn with_transport(table: RegistrationTable, config: PeerConfig, transport: T) -> Self {
        Self {
            transport,
            config: config.validated(),
            registry: MessageRegistry::new(table),
            connection: None,
            on_connected: Vec::new(),
            on_disconnected: Vec::new(),
        }
    }

    /// The configuration in use, after validation.
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Connects to the configured endpoint, closing any existing
    /// connection first. Blocks until the stream is established.
    ///
    /// # Errors
    /// Returns [`PeerError::Transport`] if the connection attempt fails.
    pub fn connect(&mut self) -> Result<(), PeerError> {
        if self.connection.is_some() {
            self.disconnect();
        }

        let endpoint = self.config.endpoint();
        debug!(%endpoint, "connecting");
        let socket = self.transport.connect(&endpoint)?;
        let connection = Connection::new(ConnectionId::SERVER, socket, self.config.limits());
        info!(%endpoint, "connected to server");
        self.connection = Some(connection);

        for callback in &mut self.on_connected {
            callback();
        }
        Ok(())
    }

    /// Sends a `Disconnect` notice and closes the connection. Does
    /// nothing when not connected.
    pub fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            self.notify_disconnected();
        }
    }

    /// `true` while the connection is up.
    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_open)
    }

    /// The server's address while connected.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().and_then(Connection::peer_addr)
    }

    /// Runs `callback` after each successful [`connect`](Self::connect).
    pub fn on_connected(&mut self, callback: impl FnMut() + 'static) {
        self.on_connected.push(Box::new(callback));
    }

    /// Runs `callback` once each time the connection ends, whichever
    /// side ended it.
    pub fn on_disconnected(&mut self, callback: impl FnMut() + 'static) {
        self.on_disconnected.push(Box::new(callback));
    }

    /// Drops the connection if it closed underneath us.
    fn reap(&mut self) {
        if self.connection.as_ref().is_some_and(|c| !c.is_open()) {
            self.connection = None;
            info!("disconnected from server");
            self.notify_disconnected();
        }
    }

    fn notify_disconnected(&mut self) {
        for callback in &mut self.on_disconnected {
            callback();
        }
    }
}

impl<T: Transport> Peer for Client<T> {
    fn tick(&mut self) {
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        pump(connection, &self.registry, self.config.max_frames_per_tick);
        self.reap();
    }

    fn send_message<M: Message>(&mut self, message: M) -> Result<(), PeerError> {
        let connection = &mut self.connection;
        let sent = send_pooled(&mut self.registry, message, |wire| {
            match connection.as_mut() {
                Some(connection) if connection.is_open() => {
                    if let Err(e) = connection.send_framed(wire) {
                        warn!(error = %e, "send failed, message dropped");
                    }
                }
                _ => debug!(
                    message = std::any::type_name::<M>(),
                    "not connected, message dropped"
                ),
            }
        });

        self.reap();
        sent
    }

    fn registry_mut(&mut self) -> &mut MessageRegistry {
        &mut self.registry
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.close();
        }
    }
}

impl<T: Transport> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.config.endpoint())
            .field("connected", &self.is_connected())
            .field("registry", &self.registry)
            .finish()
    }
}
